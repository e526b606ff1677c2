// Client configuration file: `~/.chatbook/config.toml`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Root directory for chatbook client state: `~/.chatbook/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".chatbook"))
}

pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Push channel endpoint (e.g. `wss://api.chatbook.dev/ws`).
    pub ws_url: Option<String>,
    pub organization_id: Option<i64>,
    /// Delay before re-entering authentication after a token failure.
    pub auth_retry_delay_ms: u64,
    /// Environment variable holding the bearer token.
    pub token_env_var: String,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            organization_id: None,
            auth_retry_delay_ms: 1_000,
            token_env_var: "CHATBOOK_TOKEN".into(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load from `~/.chatbook/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn auth_retry_delay(&self) -> Duration {
        Duration::from_millis(self.auth_retry_delay_ms)
    }
}

/// Transport reconnect backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { base_delay_ms: 250, max_delay_ms: 30_000 }
    }
}

/// Accept `wss://` anywhere and `ws://` only for loopback hosts.
pub fn validate_ws_url(value: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(value)
        .map_err(|error| ConfigError::InvalidUrl(format!("invalid ws_url `{value}`: {error}")))?;
    match parsed.scheme() {
        "wss" => Ok(parsed),
        "ws" if is_loopback_host(parsed.host_str()) => Ok(parsed),
        _ => Err(ConfigError::InvalidUrl(
            "ws_url must use wss (ws is allowed only for localhost testing)".into(),
        )),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("{0}")]
    InvalidUrl(String),
}
