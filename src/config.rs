use serde::Deserialize;
use std::sync::OnceLock;

use crate::error::{AppError, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Permissions {
    #[serde(default = "default_level")]
    pub default_level: String,
    #[serde(default = "default_true")]
    pub notify_unauthorized: bool,
    #[serde(default = "default_unauthorized_message")]
    pub unauthorized_message: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Claude {
    #[serde(default = "default_cli_path")]
    pub cli_path: String,
    #[serde(default = "default_claude_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerLimits {
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_admin_memory")]
    pub admin_memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_admin_cpus")]
    pub admin_cpus: f64,
    #[serde(default = "default_pids")]
    pub pids: i64,
    #[serde(default = "default_tmp_size")]
    pub tmp_size: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerNetwork {
    #[serde(default = "default_admin_network")]
    pub admin: String,
    #[serde(default = "default_trusted_network")]
    pub trusted: String,
    #[serde(default = "default_normal_network")]
    pub normal: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Docker {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub limits: DockerLimits,
    #[serde(default)]
    pub network: DockerNetwork,
}

impl Default for DockerLimits {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            admin_memory: default_admin_memory(),
            cpus: default_cpus(),
            admin_cpus: default_admin_cpus(),
            pids: default_pids(),
            tmp_size: default_tmp_size(),
        }
    }
}

impl Default for DockerNetwork {
    fn default() -> Self {
        Self {
            admin: default_admin_network(),
            trusted: default_trusted_network(),
            normal: default_normal_network(),
        }
    }
}

impl Default for Docker {
    fn default() -> Self {
        Self {
            image: default_image(),
            container_prefix: default_container_prefix(),
            data_dir: default_data_dir(),
            limits: DockerLimits::default(),
            network: DockerNetwork::default(),
        }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            default_level: default_level(),
            notify_unauthorized: true,
            unauthorized_message: default_unauthorized_message(),
        }
    }
}

impl Default for Claude {
    fn default() -> Self {
        Self {
            cli_path: default_cli_path(),
            timeout: default_claude_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_expire_minutes")]
    pub expire_minutes: i64,
    #[serde(default = "default_max_history")]
    pub max_history: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expire_minutes: default_expire_minutes(),
            max_history: default_max_history(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: i64,
    #[serde(default = "default_max_per_day")]
    pub max_per_day: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_minute: default_max_per_minute(),
            max_per_day: default_max_per_day(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Security {
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub log_message_content: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            log_message_content: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Frontend {
    #[serde(default)]
    pub telegram_token: Option<String>,
    #[serde(default = "default_true")]
    pub use_stdin: bool,
}

impl Default for Frontend {
    fn default() -> Self {
        Self {
            telegram_token: None,
            use_stdin: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub admin_wxid: String,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub claude: Claude,
    #[serde(default)]
    pub docker: Docker,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub frontend: Frontend,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_application_tag")]
    pub application_tag: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            admin_wxid: String::new(),
            permissions: Permissions::default(),
            claude: Claude::default(),
            docker: Docker::default(),
            session: SessionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            security: Security::default(),
            logging: Logging::default(),
            frontend: Frontend::default(),
            database_path: default_database_path(),
            application_tag: default_application_tag(),
        }
    }
}

fn default_level() -> String {
    "normal".into()
}
fn default_true() -> bool {
    true
}
fn default_unauthorized_message() -> String {
    "You are not authorized to use this bot.".into()
}
fn default_cli_path() -> String {
    "claude".into()
}
fn default_claude_timeout() -> u64 {
    120
}
fn default_image() -> String {
    "claude-sandbox:latest".into()
}
fn default_container_prefix() -> String {
    "claude-friend-".into()
}
fn default_data_dir() -> String {
    "~/claude-bridge-data".into()
}
fn default_memory() -> String {
    "512m".into()
}
fn default_admin_memory() -> String {
    "2g".into()
}
fn default_cpus() -> f64 {
    1.0
}
fn default_admin_cpus() -> f64 {
    2.0
}
fn default_pids() -> i64 {
    100
}
fn default_tmp_size() -> String {
    "100m".into()
}
fn default_admin_network() -> String {
    "bridge".into()
}
fn default_trusted_network() -> String {
    "claude-limited".into()
}
fn default_normal_network() -> String {
    "none".into()
}
fn default_expire_minutes() -> i64 {
    60
}
fn default_max_history() -> i64 {
    50
}
fn default_max_per_minute() -> i64 {
    10
}
fn default_max_per_day() -> i64 {
    200
}
fn default_log_level() -> String {
    "info".into()
}
fn default_database_path() -> String {
    "~/claude-bridge-data/bridge.db".into()
}
fn default_application_tag() -> String {
    "claude-bridge".into()
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Load layered settings: built-in defaults -> optional YAML file
/// (`$SM_CONFIG_FILE` or `./config.yaml` if present) -> `SM_`-prefixed
/// environment overrides. Safe to call more than once; only the first
/// call's result is kept.
pub fn load() -> Result<&'static Settings> {
    if let Some(s) = SETTINGS.get() {
        return Ok(s);
    }

    let config_file = std::env::var("SM_CONFIG_FILE").unwrap_or_else(|_| "config.yaml".into());

    let mut builder = config::Config::builder();
    if std::path::Path::new(&config_file).exists() {
        builder = builder.add_source(config::File::with_name(&config_file));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("SM")
            .separator("__")
            .try_parsing(true),
    );

    let built = builder
        .build()
        .map_err(|e| AppError::ConfigInvalid(e.to_string()))?;
    let settings: Settings = built
        .try_deserialize()
        .map_err(|e| AppError::ConfigInvalid(e.to_string()))?;

    Ok(SETTINGS.get_or_init(|| settings))
}

pub fn settings() -> &'static Settings {
    SETTINGS
        .get()
        .expect("config::load() must be called before config::settings()")
}

/// Parse a memory string like "512m", "2G", "100k" into bytes.
/// Case-insensitive single-letter suffix; no suffix means bytes.
pub fn parse_memory_bytes(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AppError::ConfigInvalid("empty memory string".into()));
    }

    let (digits, suffix) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => (&raw[..idx], &raw[idx..]),
        None => (raw, ""),
    };

    if digits.is_empty() {
        return Err(AppError::ConfigInvalid(format!("invalid memory string: {raw}")));
    }

    let value: i64 = digits
        .parse()
        .map_err(|_| AppError::ConfigInvalid(format!("invalid memory string: {raw}")))?;

    let multiplier: i64 = match suffix.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        other => {
            return Err(AppError::ConfigInvalid(format!(
                "unrecognized memory suffix: {other}"
            )));
        }
    };

    Ok(value * multiplier)
}

/// Convert a floating-point CPU count into the nanosecond quota Docker's
/// CPU-quota API expects, per spec §6 ("multiplies by 10^9 rounded to
/// integer").
pub fn cpus_to_nanos(cpus: f64) -> i64 {
    (cpus * 1_000_000_000.0).round() as i64
}

/// Resolve a leading `~` to the process owner's home directory.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}{}", home.to_string_lossy(), rest);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse_memory_bytes("512").unwrap(), 512);
    }

    #[test]
    fn parses_kilobytes_case_insensitive() {
        assert_eq!(parse_memory_bytes("2K").unwrap(), 2048);
        assert_eq!(parse_memory_bytes("2k").unwrap(), 2048);
    }

    #[test]
    fn parses_megabytes_and_gigabytes() {
        assert_eq!(parse_memory_bytes("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("2g").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn rejects_empty_string() {
        assert!(parse_memory_bytes("").is_err());
    }

    #[test]
    fn rejects_negative() {
        assert!(parse_memory_bytes("-5m").is_err());
    }

    #[test]
    fn rejects_unknown_suffix() {
        assert!(parse_memory_bytes("5x").is_err());
    }

    #[test]
    fn cpu_conversion_rounds_to_nearest_ns() {
        assert_eq!(cpus_to_nanos(1.0), 1_000_000_000);
        assert_eq!(cpus_to_nanos(0.5), 500_000_000);
        assert_eq!(cpus_to_nanos(1.5), 1_500_000_000);
    }

    #[test]
    fn expand_home_replaces_tilde_prefix() {
        unsafe {
            std::env::set_var("HOME", "/home/tester");
        }
        assert_eq!(expand_home("~/data"), "/home/tester/data");
        assert_eq!(expand_home("/abs/data"), "/abs/data");
    }
}
