use std::collections::HashMap;
use std::time::Duration;

use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ContainerStateStatusEnum, HealthStatusEnum};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;

use crate::error::{AppError, Result};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Output of a completed `exec` call: captured stdout/stderr and the exit
/// code reported by the engine.
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
}

/// Thin typed wrapper around [`bollard::Docker`]; every call is guarded by
/// a per-call timeout so a wedged daemon never hangs the caller forever.
/// Cheaply `Clone`, since `bollard::Docker` itself wraps a shared
/// connection pool.
#[derive(Clone)]
pub struct Engine {
    docker: Docker,
    call_timeout: Duration,
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = std::result::Result<T, bollard::errors::Error>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(AppError::ContainerOperationFailed(e.to_string())),
        Err(_) => Err(AppError::EngineUnavailable(format!(
            "engine call exceeded {}s",
            timeout.as_secs()
        ))),
    }
}

impl Engine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| AppError::EngineUnavailable(e.to_string()))?;
        Ok(Self {
            docker,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub async fn health_check(&self) -> Result<()> {
        with_timeout(self.call_timeout, async {
            self.docker.ping().await.map(|_| ())
        })
        .await
    }

    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        match with_timeout(self.call_timeout, self.docker.inspect_image(image)).await {
            Ok(_) => Ok(true),
            Err(AppError::ContainerOperationFailed(msg)) if msg.contains("404") => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn pull_image(&self, image: &str) -> Result<()> {
        let options = bollard::query_parameters::CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| AppError::ImageBuildFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Build `tag` from the Dockerfile at `context_dir`. The directory's
    /// contents are packed into a tar stream with the `tar` binary (the
    /// Dockerfile's own contents are an external collaborator, out of
    /// scope here) and handed to the engine's build API.
    pub async fn build_image(&self, context_dir: &str, tag: &str) -> Result<()> {
        let output = tokio::process::Command::new("tar")
            .arg("-C")
            .arg(context_dir)
            .arg("-cf")
            .arg("-")
            .arg(".")
            .output()
            .await
            .map_err(|e| AppError::ImageBuildFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(AppError::ImageBuildFailed(format!(
                "tar context packing failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let options = bollard::query_parameters::BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: Some(tag.to_string()),
            rm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(output.stdout.into()));
        while let Some(result) = stream.next().await {
            result.map_err(|e| AppError::ImageBuildFailed(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn create_network_if_absent(&self, name: &str) -> Result<()> {
        if name == "bridge" || name == "none" || name == "host" {
            return Ok(());
        }
        let existing = with_timeout(self.call_timeout, self.docker.list_networks::<String>(None)).await?;
        if existing.iter().any(|n| n.name.as_deref() == Some(name)) {
            return Ok(());
        }
        let options = bollard::models::NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            internal: Some(true),
            ..Default::default()
        };
        with_timeout(self.call_timeout, self.docker.create_network(options))
            .await
            .map(|_| ())
    }

    pub async fn container_exists(&self, name: &str) -> Result<bool> {
        match self.inspect(name).await {
            Ok(_) => Ok(true),
            Err(AppError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn inspect(&self, name: &str) -> Result<bollard::models::ContainerInspectResponse> {
        match with_timeout(
            self.call_timeout,
            self.docker
                .inspect_container(name, None::<InspectContainerOptions>),
        )
        .await
        {
            Ok(info) => Ok(info),
            Err(AppError::ContainerOperationFailed(msg)) if msg.contains("404") => {
                Err(AppError::NotFound(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        let info = self.inspect(name).await?;
        Ok(info
            .state
            .and_then(|s| s.status)
            .map(|status| status == ContainerStateStatusEnum::RUNNING)
            .unwrap_or(false))
    }

    pub async fn create_container(
        &self,
        name: &str,
        config: ContainerCreateBody,
    ) -> Result<String> {
        let options = CreateContainerOptions {
            name: Some(name.to_string()),
            ..Default::default()
        };
        let response = with_timeout(
            self.call_timeout,
            self.docker.create_container(Some(options), config),
        )
        .await?;
        Ok(response.id)
    }

    pub async fn start_container(&self, name: &str) -> Result<()> {
        with_timeout(
            self.call_timeout,
            self.docker
                .start_container(name, None::<StartContainerOptions>),
        )
        .await
    }

    pub async fn stop_container(&self, name: &str, grace_seconds: i32) -> Result<()> {
        let options = StopContainerOptions {
            t: Some(grace_seconds),
            ..Default::default()
        };
        match with_timeout(
            self.call_timeout,
            self.docker.stop_container(name, Some(options)),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(AppError::ContainerOperationFailed(msg))
                if msg.contains("404") || msg.contains("not running") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Force-remove; succeeds silently if the container is already absent
    /// (spec §4.C "`destroy` on a non-existent container succeeds silently").
    pub async fn remove_container(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match with_timeout(
            self.call_timeout,
            self.docker.remove_container(name, Some(options)),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(AppError::ContainerOperationFailed(msg)) if msg.contains("404") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_labeled(&self, label: &str) -> Result<Vec<bollard::models::ContainerSummary>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };
        with_timeout(self.call_timeout, self.docker.list_containers(Some(options))).await
    }

    pub async fn stats_once(&self, name: &str) -> Result<bollard::container::Stats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(name, Some(options));
        match tokio::time::timeout(self.call_timeout, stream.next()).await {
            Ok(Some(Ok(stats))) => Ok(stats),
            Ok(Some(Err(e))) => Err(AppError::ContainerOperationFailed(e.to_string())),
            Ok(None) => Err(AppError::ContainerOperationFailed("no stats sample".into())),
            Err(_) => Err(AppError::EngineUnavailable("stats call timed out".into())),
        }
    }

    /// Run `argv` inside `name`, optionally as `root`, waiting up to
    /// `timeout` for completion, and collecting stdout/stderr separately.
    pub async fn exec(
        &self,
        name: &str,
        argv: Vec<String>,
        as_root: bool,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let exec_config = CreateExecOptions {
            cmd: Some(argv),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            user: if as_root {
                Some("root".to_string())
            } else {
                None
            },
            ..Default::default()
        };

        let exec = with_timeout(self.call_timeout, self.docker.create_exec(name, exec_config)).await?;

        let run = async {
            let mut stdout = String::new();
            let mut stderr = String::new();

            match self
                .docker
                .start_exec(&exec.id, Some(StartExecOptions::default()))
                .await
                .map_err(|e| AppError::ContainerOperationFailed(e.to_string()))?
            {
                StartExecResults::Attached {
                    output: mut stream, ..
                } => {
                    while let Some(chunk) = stream.next().await {
                        match chunk.map_err(|e| AppError::ContainerOperationFailed(e.to_string()))? {
                            LogOutput::StdOut { message } => {
                                stdout.push_str(&String::from_utf8_lossy(&message))
                            }
                            LogOutput::StdErr { message } => {
                                stderr.push_str(&String::from_utf8_lossy(&message))
                            }
                            _ => {}
                        }
                    }
                }
                StartExecResults::Detached => {
                    return Err(AppError::ContainerOperationFailed(
                        "unexpected detached exec".into(),
                    ));
                }
            }

            let inspected = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| AppError::ContainerOperationFailed(e.to_string()))?;

            Ok(ExecOutput {
                stdout,
                stderr,
                exit_code: inspected.exit_code,
            })
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(AppError::ExecTimeout(timeout.as_secs())),
        }
    }

    pub async fn is_healthy_or_running(&self, name: &str) -> Result<bool> {
        let info = self.inspect(name).await?;
        let health = info
            .state
            .as_ref()
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status);
        Ok(matches!(
            health,
            None | Some(HealthStatusEnum::HEALTHY) | Some(HealthStatusEnum::EMPTY)
        ))
    }
}
