use std::collections::HashMap;
use std::time::Duration;

use bollard::models::{
    ContainerCreateBody, HostConfig, Mount, MountTypeEnum, RestartPolicy, RestartPolicyNameEnum,
};

use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::store::Permission;

use super::engine::Engine;
use super::policy::{
    claude_config_host_dir, container_name, forwarded_auth_env, labels, resource_policy,
    workspace_host_dir,
};

const SANDBOX_USER: &str = "sandbox";
const SANDBOX_WORKDIR: &str = "/home/sandbox/workspace";
const SANDBOX_CLAUDE_HOME: &str = "/home/sandbox/.claude";
const GRACEFUL_STOP_SECONDS: i32 = 10;
const ADMIN_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const KILL_AFTER_GRACE: Duration = Duration::from_secs(5);

pub struct ContainerListing {
    pub name: String,
    pub status: String,
    pub wxid: Option<String>,
    pub permission: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub mem_bytes: u64,
    pub mem_limit_bytes: u64,
    pub pids: u64,
}

/// Owns container naming, volume paths, and per-tier policy. Caches
/// nothing about container state — every query goes to the engine
/// (spec §3 "Ownership").
#[derive(Clone)]
pub struct DockerManager {
    engine: Engine,
}

impl DockerManager {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub async fn health_check(&self) -> Result<()> {
        self.engine.health_check().await
    }

    pub async fn image_exists(&self, settings: &Settings) -> Result<bool> {
        self.engine.image_exists(&settings.docker.image).await
    }

    pub async fn build_image(&self, settings: &Settings, context_dir: &str) -> Result<()> {
        self.engine.build_image(context_dir, &settings.docker.image).await
    }

    pub async fn init_networks(&self, settings: &Settings) -> Result<()> {
        for network in [
            &settings.docker.network.admin,
            &settings.docker.network.trusted,
            &settings.docker.network.normal,
        ] {
            self.engine.create_network_if_absent(network).await?;
        }
        Ok(())
    }

    /// Create (if absent) then start (if not running) the user's container.
    /// Safe to call repeatedly.
    pub async fn ensure_container(
        &self,
        settings: &Settings,
        wxid: &str,
        permission: Permission,
    ) -> Result<String> {
        let name = container_name(settings, wxid);

        if !self.engine.container_exists(&name).await? {
            self.create(settings, wxid, permission, &name).await?;
        }

        if !self.engine.is_running(&name).await? {
            self.engine.start_container(&name).await?;
        }

        Ok(name)
    }

    async fn create(
        &self,
        settings: &Settings,
        wxid: &str,
        permission: Permission,
        name: &str,
    ) -> Result<()> {
        let policy = resource_policy(settings, permission)?;

        let workspace_dir = workspace_host_dir(settings, wxid);
        let claude_config_dir = claude_config_host_dir(settings, wxid);
        std::fs::create_dir_all(&workspace_dir)
            .map_err(|e| AppError::ContainerOperationFailed(e.to_string()))?;
        std::fs::create_dir_all(&claude_config_dir)
            .map_err(|e| AppError::ContainerOperationFailed(e.to_string()))?;

        let mut tmpfs = HashMap::new();
        tmpfs.insert(
            "/tmp".to_string(),
            format!("size={}", policy.tmp_size_bytes),
        );

        let mut env = vec![format!("WXID={wxid}")];
        env.extend(forwarded_auth_env());

        let host_config = HostConfig {
            memory: Some(policy.memory_bytes),
            nano_cpus: Some(policy.nano_cpus),
            pids_limit: Some(policy.pids_limit),
            tmpfs: Some(tmpfs),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            network_mode: Some(policy.network),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            mounts: Some(vec![
                Mount {
                    typ: Some(MountTypeEnum::BIND),
                    source: Some(workspace_dir),
                    target: Some(SANDBOX_WORKDIR.to_string()),
                    read_only: Some(false),
                    ..Default::default()
                },
                Mount {
                    typ: Some(MountTypeEnum::BIND),
                    source: Some(claude_config_dir),
                    target: Some(SANDBOX_CLAUDE_HOME.to_string()),
                    read_only: Some(false),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(settings.docker.image.clone()),
            user: Some(SANDBOX_USER.to_string()),
            env: Some(env),
            labels: Some(labels(settings, wxid, permission)),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.engine.create_container(name, config).await?;
        self.engine.start_container(name).await?;

        // Ownership fix-up for host-created (root-owned) bind mounts;
        // non-fatal on failure (spec §4.C).
        let fixup = self
            .engine
            .exec(
                name,
                vec![
                    "chown".to_string(),
                    "-R".to_string(),
                    "sandbox:sandbox".to_string(),
                    SANDBOX_WORKDIR.to_string(),
                    SANDBOX_CLAUDE_HOME.to_string(),
                ],
                true,
                ADMIN_COMMAND_TIMEOUT,
            )
            .await;
        if let Err(e) = fixup {
            tracing::warn!(wxid, error = %e, "ownership fix-up failed, continuing");
        }

        Ok(())
    }

    /// Run the Claude CLI inside the user's container, wrapped in the
    /// `timeout` coreutil so a wedged process is reliably killed even
    /// though the host holds no PID handle (spec §4.D step 8).
    pub async fn exec_claude(
        &self,
        settings: &Settings,
        wxid: &str,
        system_prompt: &str,
        message: &str,
        claude_session: Option<&str>,
        permission: Permission,
        timeout_s: u64,
    ) -> Result<(String, String)> {
        let name = container_name(settings, wxid);

        let mut argv = vec![
            "timeout".to_string(),
            format!("--kill-after={}", KILL_AFTER_GRACE.as_secs()),
            timeout_s.to_string(),
            settings.claude.cli_path.clone(),
            "-p".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
            "--append-system-prompt".to_string(),
            system_prompt.to_string(),
        ];

        if let Some(session) = claude_session {
            argv.push("--resume".to_string());
            argv.push(session.to_string());
        }

        if permission == Permission::Normal {
            argv.push("--allowedTools".to_string());
            argv.push("".to_string());
        }

        argv.push(message.to_string());

        let wait_budget = Duration::from_secs(timeout_s + KILL_AFTER_GRACE.as_secs() + 5);
        let output = self.engine.exec(&name, argv, false, wait_budget).await?;

        match output.exit_code {
            Some(0) | None => Ok((output.stdout, output.stderr)),
            Some(124) | Some(137) => Err(AppError::ExecTimeout(timeout_s)),
            Some(_) => Err(AppError::ExecFailed(output.stderr)),
        }
    }

    /// Arbitrary short admin command, bounded by a fixed admin-grade
    /// timeout (spec §4.C).
    pub async fn exec_command(
        &self,
        settings: &Settings,
        wxid: &str,
        shell_command: &str,
        as_root: bool,
    ) -> Result<String> {
        let name = container_name(settings, wxid);
        let argv = vec!["sh".to_string(), "-c".to_string(), shell_command.to_string()];
        let output = self
            .engine
            .exec(&name, argv, as_root, ADMIN_COMMAND_TIMEOUT)
            .await?;
        Ok(output.stdout)
    }

    pub async fn start(&self, settings: &Settings, wxid: &str) -> Result<()> {
        let name = container_name(settings, wxid);
        self.engine.start_container(&name).await
    }

    pub async fn stop(&self, settings: &Settings, wxid: &str) -> Result<()> {
        let name = container_name(settings, wxid);
        self.engine.stop_container(&name, GRACEFUL_STOP_SECONDS).await
    }

    pub async fn destroy(&self, settings: &Settings, wxid: &str) -> Result<()> {
        let name = container_name(settings, wxid);
        self.engine.remove_container(&name).await
    }

    pub async fn rebuild(
        &self,
        settings: &Settings,
        wxid: &str,
        permission: Permission,
    ) -> Result<String> {
        self.destroy(settings, wxid).await?;
        self.ensure_container(settings, wxid, permission).await
    }

    pub async fn stats(&self, settings: &Settings, wxid: &str) -> Result<ContainerStats> {
        let name = container_name(settings, wxid);
        let raw = self.engine.stats_once(&name).await?;

        let cpu_percent = cpu_percent_from_stats(&raw);
        let mem_bytes = raw.memory_stats.as_ref().and_then(|m| m.usage).unwrap_or(0);
        let mem_limit_bytes = raw.memory_stats.as_ref().and_then(|m| m.limit).unwrap_or(0);
        let pids = raw.pids_stats.as_ref().and_then(|p| p.current).unwrap_or(0);

        Ok(ContainerStats {
            cpu_percent,
            mem_bytes,
            mem_limit_bytes,
            pids,
        })
    }

    pub async fn disk_usage(&self, settings: &Settings, wxid: &str) -> Result<String> {
        self.exec_command(settings, wxid, &format!("du -sh {SANDBOX_WORKDIR} 2>/dev/null | cut -f1"), false)
            .await
    }

    pub async fn list_containers(&self, settings: &Settings) -> Result<Vec<ContainerListing>> {
        let label = format!("app={}", settings.application_tag);
        let summaries = self.engine.list_labeled(&label).await?;

        Ok(summaries
            .into_iter()
            .map(|summary| {
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let status = summary.status.unwrap_or_default();
                let wxid = summary.labels.as_ref().and_then(|l| l.get("wxid").cloned());
                let permission = summary
                    .labels
                    .as_ref()
                    .and_then(|l| l.get("permission").cloned());
                ContainerListing {
                    name,
                    status,
                    wxid,
                    permission,
                }
            })
            .collect())
    }

    pub async fn stop_all(&self, settings: &Settings) -> Result<usize> {
        let containers = self.list_containers(settings).await?;
        let mut stopped = 0;
        for container in containers {
            if self
                .engine
                .stop_container(&container.name, GRACEFUL_STOP_SECONDS)
                .await
                .is_ok()
            {
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    /// Remove stopped app-labeled containers.
    pub async fn cleanup(&self, settings: &Settings) -> Result<usize> {
        let containers = self.list_containers(settings).await?;
        let mut removed = 0;
        for container in containers {
            if container.status.to_lowercase().contains("exited") {
                if self.engine.remove_container(&container.name).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn cpu_percent_from_stats(stats: &bollard::container::Stats) -> f64 {
    let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
        - stats.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
        - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
    let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;

    if system_delta > 0.0 && cpu_delta > 0.0 {
        (cpu_delta / system_delta) * online_cpus * 100.0
    } else {
        0.0
    }
}
