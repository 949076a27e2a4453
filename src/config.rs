//! Configuration for plugin-bridge

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::{BackoffPolicy, ClientConfig};
use crate::error::{ChannelError, Result};
use crate::progress::ProgressHubConfig;

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("plugin-bridge")
        .join("config.toml")
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Relay server WebSocket URL
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Channel to join (random when unset)
    #[serde(default)]
    pub channel: Option<String>,

    /// Reconnect after abnormal closes
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Consecutive reconnect attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Join acknowledgement timeout in milliseconds
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Reconnect delay growth per attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Re-broadcast progress received from an inner hop
    #[serde(default = "default_true")]
    pub relay_progress: bool,

    /// How long finished commands stay visible in the progress hub
    #[serde(default = "default_progress_retention_secs")]
    pub progress_retention_secs: u64,
}

fn default_server_url() -> String {
    crate::channel::DEFAULT_SERVER_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_progress_retention_secs() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            channel: None,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            request_timeout_ms: 30_000,
            join_timeout_ms: 10_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            backoff_factor: 1.5,
            relay_progress: true,
            progress_retention_secs: 300,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ChannelError::Config(e.to_string()))
    }

    /// Save config to file, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content =
            toml::to_string_pretty(self).map_err(|e| ChannelError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load `path` if it exists, otherwise defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn default_path() -> PathBuf {
        default_config_path()
    }

    /// Reject values the channel cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.server_url)
            .map_err(|e| ChannelError::Config(format!("invalid server_url {}: {}", self.server_url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ChannelError::Config(format!(
                "server_url must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }
        if let Some(channel) = &self.channel {
            if channel.trim().is_empty() {
                return Err(ChannelError::Config("channel must not be empty".into()));
            }
        }
        if self.request_timeout_ms == 0 {
            return Err(ChannelError::Config("request_timeout_ms must be positive".into()));
        }
        if self.join_timeout_ms == 0 {
            return Err(ChannelError::Config("join_timeout_ms must be positive".into()));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ChannelError::Config(
                "backoff_max_ms must not be below backoff_base_ms".into(),
            ));
        }
        if !(self.backoff_factor >= 1.0 && self.backoff_factor.is_finite()) {
            return Err(ChannelError::Config(format!(
                "backoff_factor must be at least 1, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }

    /// Runtime settings for the channel client
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server_url: self.server_url.clone(),
            channel: self.channel.clone(),
            auto_reconnect: self.auto_reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.backoff_base_ms),
                self.backoff_factor,
                Duration::from_millis(self.backoff_max_ms),
            ),
            relay_progress: self.relay_progress,
        }
    }

    pub fn progress_hub_config(&self) -> ProgressHubConfig {
        ProgressHubConfig {
            retention: Duration::from_secs(self.progress_retention_secs),
            ..Default::default()
        }
    }
}
