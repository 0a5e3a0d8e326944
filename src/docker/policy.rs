use std::collections::HashMap;

use crate::config::{cpus_to_nanos, expand_home, parse_memory_bytes, Settings};
use crate::error::Result;
use crate::store::Permission;

/// Sentinel name used for a friend whose `wxid` is empty after sanitization,
/// so it never collides with a real, non-empty sanitized wxid.
pub const EMPTY_WXID_SENTINEL: &str = "_empty";

/// Replace every character outside `[A-Za-z0-9_.-]` with `_` (spec §3). An
/// all-empty or all-invalid input sanitizes to [`EMPTY_WXID_SENTINEL`]
/// rather than an empty string, since container names must be non-empty.
pub fn sanitize(wxid: &str) -> String {
    if wxid.is_empty() {
        return EMPTY_WXID_SENTINEL.to_string();
    }
    let cleaned: String = wxid
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        EMPTY_WXID_SENTINEL.to_string()
    } else {
        cleaned
    }
}

pub fn container_name(settings: &Settings, wxid: &str) -> String {
    format!("{}{}", settings.docker.container_prefix, sanitize(wxid))
}

pub fn workspace_host_dir(settings: &Settings, wxid: &str) -> String {
    format!("{}/{}/workspace", expand_home(&settings.docker.data_dir), wxid)
}

pub fn claude_config_host_dir(settings: &Settings, wxid: &str) -> String {
    format!(
        "{}/{}/claude-config",
        expand_home(&settings.docker.data_dir),
        wxid
    )
}

pub struct ResourcePolicy {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub tmp_size_bytes: i64,
    pub network: String,
}

/// Compose the per-tier resource and network policy from configuration
/// (spec §4.C "Creation policy").
pub fn resource_policy(settings: &Settings, permission: Permission) -> Result<ResourcePolicy> {
    let limits = &settings.docker.limits;
    let is_admin = permission == Permission::Admin;

    let memory_bytes = parse_memory_bytes(if is_admin {
        &limits.admin_memory
    } else {
        &limits.memory
    })?;
    let cpus = if is_admin { limits.admin_cpus } else { limits.cpus };
    let tmp_size_bytes = parse_memory_bytes(&limits.tmp_size)?;

    let network = match permission {
        Permission::Admin => settings.docker.network.admin.clone(),
        Permission::Trusted => settings.docker.network.trusted.clone(),
        Permission::Normal | Permission::Blocked => settings.docker.network.normal.clone(),
    };

    Ok(ResourcePolicy {
        memory_bytes,
        nano_cpus: cpus_to_nanos(cpus),
        pids_limit: limits.pids,
        tmp_size_bytes,
        network,
    })
}

/// Labels attached to every sandbox container, used by `list_containers`
/// and `stop_all`/`cleanup` to find app-owned containers.
pub fn labels(settings: &Settings, wxid: &str, permission: Permission) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("app".to_string(), settings.application_tag.clone());
    labels.insert("wxid".to_string(), wxid.to_string());
    labels.insert("permission".to_string(), permission.as_str().to_string());
    labels
}

pub fn forwarded_auth_env() -> Vec<String> {
    let mut env = Vec::new();
    if let Ok(token) = std::env::var("CLAUDE_CODE_OAUTH_TOKEN") {
        env.push(format!("CLAUDE_CODE_OAUTH_TOKEN={token}"));
    } else if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        env.push(format!("ANTHROPIC_API_KEY={key}"));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_disallowed_characters() {
        assert_eq!(sanitize("user@host!"), "user_host_");
        assert_eq!(sanitize("a.b-c_d"), "a.b-c_d");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize("weird/id with spaces");
        let twice = sanitize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_empty_wxid_uses_distinct_sentinel() {
        assert_eq!(sanitize(""), EMPTY_WXID_SENTINEL);
        assert_ne!(sanitize(""), sanitize("_empty_but_real"));
    }

    #[test]
    fn sanitize_all_invalid_chars_becomes_underscores() {
        assert_eq!(sanitize("***"), "___");
        assert_ne!(sanitize("***"), EMPTY_WXID_SENTINEL);
    }
}
