use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ClientError;

/// Client configuration loaded from veilchat.toml with env var overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the REST API. Default: "http://127.0.0.1:3000"
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Directory holding per-user vault databases. Default: "vault"
    #[serde(default = "default_vault_dir")]
    pub vault_dir: PathBuf,
    /// Tracing log level. Default: "info"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Whole-request timeout for REST calls. Default: 10
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Connect timeout for REST calls. Default: 5
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Interval between background reconciliation passes. Default: 30
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Delay after reconnecting before reconciling. Default: 1500
    #[serde(default = "default_reconnect_settle_ms")]
    pub reconnect_settle_ms: u64,
    /// How long an unacknowledged send is tracked. Default: 30
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
    /// First partner-key retry delay; doubles per attempt. Default: 1000
    #[serde(default = "default_key_retry_base_ms")]
    pub key_retry_base_ms: u64,
    /// Upper bound on the partner-key retry delay. Default: 30000
    #[serde(default = "default_key_retry_max_ms")]
    pub key_retry_max_ms: u64,
    /// Partner-key fetch attempts after a key regeneration. Default: 5
    #[serde(default = "default_key_retry_attempts")]
    pub key_retry_attempts: u32,
    /// Window for matching a server record to a local pending send. Default: 5000
    #[serde(default = "default_timestamp_tolerance_ms")]
    pub timestamp_tolerance_ms: i64,
    /// How long a partner typing indicator stays up. Default: 5000
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,
    /// Minimum gap between outbound typing events. Default: 2000
    #[serde(default = "default_typing_throttle_ms")]
    pub typing_throttle_ms: u64,
    /// Interval between latency probes. Default: 25
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Keep vault protection keys in the OS keychain. Default: true
    ///
    /// When false, protection keys live in memory only and every vault is
    /// session-only: it cannot be opened again after the process exits.
    #[serde(default = "default_use_os_keychain")]
    pub use_os_keychain: bool,
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_vault_dir() -> PathBuf {
    PathBuf::from("vault")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_sync_interval_secs() -> u64 {
    30
}
fn default_reconnect_settle_ms() -> u64 {
    1500
}
fn default_pending_timeout_secs() -> u64 {
    30
}
fn default_key_retry_base_ms() -> u64 {
    1000
}
fn default_key_retry_max_ms() -> u64 {
    30_000
}
fn default_key_retry_attempts() -> u32 {
    5
}
fn default_timestamp_tolerance_ms() -> i64 {
    5000
}
fn default_typing_timeout_ms() -> u64 {
    5000
}
fn default_typing_throttle_ms() -> u64 {
    2000
}
fn default_health_interval_secs() -> u64 {
    25
}
fn default_use_os_keychain() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            vault_dir: default_vault_dir(),
            log_level: default_log_level(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            reconnect_settle_ms: default_reconnect_settle_ms(),
            pending_timeout_secs: default_pending_timeout_secs(),
            key_retry_base_ms: default_key_retry_base_ms(),
            key_retry_max_ms: default_key_retry_max_ms(),
            key_retry_attempts: default_key_retry_attempts(),
            timestamp_tolerance_ms: default_timestamp_tolerance_ms(),
            typing_timeout_ms: default_typing_timeout_ms(),
            typing_throttle_ms: default_typing_throttle_ms(),
            health_interval_secs: default_health_interval_secs(),
            use_os_keychain: default_use_os_keychain(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from TOML file with environment variable overrides.
    ///
    /// Reads `veilchat.toml` from CWD (or path in `CONFIG_PATH` env var).
    /// A missing file yields the defaults; env overrides apply either way.
    pub fn load() -> Result<Self, ClientError> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "veilchat.toml".to_string());
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut config = Self::default();
                config.apply_env_overrides()?;
                Ok(config)
            }
            Err(e) => Err(ClientError::Config(format!("failed to read {path}: {e}"))),
        }
    }

    /// Load configuration from a TOML string, then apply env var overrides.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ClientError> {
        let mut config: ClientConfig =
            toml::from_str(toml_str).map_err(|e| ClientError::Config(e.to_string()))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the config.
    ///
    /// Returns an error if an env var is set but has an invalid format
    /// (e.g., VEILCHAT_SYNC_INTERVAL_SECS=abc).
    pub fn apply_env_overrides(&mut self) -> Result<(), ClientError> {
        if let Ok(val) = std::env::var("VEILCHAT_API_URL") {
            self.api_base_url = val;
        }
        if let Ok(val) = std::env::var("VEILCHAT_VAULT_DIR") {
            self.vault_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("LOG_LEVEL") {
            self.log_level = val;
        }
        if let Ok(val) = std::env::var("VEILCHAT_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_env("VEILCHAT_REQUEST_TIMEOUT_SECS", &val)?;
        }
        if let Ok(val) = std::env::var("VEILCHAT_SYNC_INTERVAL_SECS") {
            self.sync_interval_secs = parse_env("VEILCHAT_SYNC_INTERVAL_SECS", &val)?;
        }
        if let Ok(val) = std::env::var("VEILCHAT_USE_OS_KEYCHAIN") {
            self.use_os_keychain = parse_env("VEILCHAT_USE_OS_KEYCHAIN", &val)?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, val: &str) -> Result<T, ClientError> {
    val.parse()
        .map_err(|_| ClientError::Config(format!("invalid {name} value: {val}")))
}

/// Timing knobs for a chat session, derived from [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub sync_interval: Duration,
    pub reconnect_settle: Duration,
    pub pending_timeout: Duration,
    pub key_retry_base: Duration,
    pub key_retry_max: Duration,
    pub key_retry_attempts: u32,
    pub timestamp_tolerance_ms: i64,
    pub typing_timeout: Duration,
    pub typing_throttle: Duration,
    pub health_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for SessionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            sync_interval: Duration::from_secs(config.sync_interval_secs),
            reconnect_settle: Duration::from_millis(config.reconnect_settle_ms),
            pending_timeout: Duration::from_secs(config.pending_timeout_secs),
            key_retry_base: Duration::from_millis(config.key_retry_base_ms),
            key_retry_max: Duration::from_millis(config.key_retry_max_ms),
            key_retry_attempts: config.key_retry_attempts,
            timestamp_tolerance_ms: config.timestamp_tolerance_ms,
            typing_timeout: Duration::from_millis(config.typing_timeout_ms),
            typing_throttle: Duration::from_millis(config.typing_throttle_ms),
            health_interval: Duration::from_secs(config.health_interval_secs),
        }
    }
}

impl SessionSettings {
    /// Delay before partner-key retry `attempt` (1-based): base doubled per
    /// attempt, capped at the configured maximum.
    pub fn key_retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.key_retry_base
            .checked_mul(factor)
            .unwrap_or(self.key_retry_max)
            .min(self.key_retry_max)
    }
}
