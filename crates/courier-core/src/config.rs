//! Bootstrap configuration loaded from `config.toml`.
//!
//! This covers only what is needed to start the process: where the data
//! directory lives, how to reach the backend, and which platform bridges are
//! enabled. Everything the agent mutates at runtime (token, avatars,
//! blacklist) lives in JSON documents under the data directory instead.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::CourierError;

/// Top-level Courier configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub courier: CourierConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
}

/// General agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Audit files older than this many days are eligible for `cleanup_old`.
    #[serde(default = "default_history_keep_days")]
    pub history_keep_days: i64,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            history_keep_days: default_history_keep_days(),
        }
    }
}

/// Remote backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Seconds between polling cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Per-request timeout for backend calls.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            poll_interval_secs: default_poll_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Platform bridge settings, one optional section per supported platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub telegram: Option<TelegramBridgeConfig>,
}

/// Telegram bridge daemon settings. The bridge owns the wire protocol;
/// Courier talks to it over local HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramBridgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    /// Per-request timeout for bridge calls.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for TelegramBridgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bridge_url: default_bridge_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist.
pub fn load(path: &str) -> Result<Config, CourierError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| CourierError::Validation(format!("failed to read {}: {e}", path.display())))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| CourierError::Validation(format!("failed to parse config: {e}")))?;

    Ok(config)
}

// ---------- defaults ----------

fn default_data_dir() -> String {
    "~/.courier".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_history_keep_days() -> i64 {
    30
}

fn default_base_url() -> String {
    "https://hubfeed.app".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    30
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:8077".to_string()
}

fn default_true() -> bool {
    true
}
