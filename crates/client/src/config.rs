//! Configuration management for the TermRelay client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termrelay/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::RelayClientConfig;
use crate::reconnect::ReconnectPolicy;

/// Default relay endpoint (`host:port`, no scheme).
pub const DEFAULT_RELAY_ENDPOINT: &str = "localhost:8000";

/// Name of the key file inside the data directory.
pub const KEY_FILE_NAME: &str = "keys.json";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("relay endpoint must be host:port without scheme or path, got {0:?}")]
    InvalidEndpoint(String),

    #[error("{0} must be greater than 0")]
    ZeroTimeout(&'static str),

    #[error("base_delay_ms must be greater than 0")]
    ZeroBaseDelay,

    #[error("max_delay_ms ({max}) must not be less than base_delay_ms ({base})")]
    MaxDelayBelowBase { base: u64, max: u64 },

    #[error("max_attempts must be greater than 0")]
    ZeroMaxAttempts,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the TermRelay client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General client configuration.
    pub client: ClientSection,

    /// Relay connection configuration.
    pub relay: RelaySection,

    /// Automatic reconnection configuration.
    pub reconnect: ReconnectSection,
}

/// General client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSection {
    /// Directory for storing client data (key file).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Relay connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelaySection {
    /// Relay authority as `host:port`.
    pub endpoint: String,

    /// Use `wss://` instead of `ws://`.
    pub secure: bool,

    /// Seconds to wait for the WebSocket handshake.
    pub connect_timeout_secs: u64,

    /// Seconds between heartbeat pings.
    pub heartbeat_interval_secs: u64,

    /// Extra seconds to wait for a pong before declaring the link dead.
    pub heartbeat_timeout_secs: u64,
}

/// Automatic reconnection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    /// Reconnect automatically after an unexpected close.
    pub auto_reconnect: bool,

    /// Delay before the first reconnect attempt, in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound on the delay between attempts, in milliseconds.
    pub max_delay_ms: u64,

    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_RELAY_ENDPOINT.to_string(),
            secure: false,
            connect_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            auto_reconnect: true,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termrelay")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termrelay")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMRELAY_RELAY_ENDPOINT: Override relay endpoint
    /// - TERMRELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("TERMRELAY_RELAY_ENDPOINT") {
            if !endpoint.is_empty() {
                tracing::info!(%endpoint, "overriding relay endpoint from environment");
                self.relay.endpoint = endpoint;
            }
        }

        if let Ok(level) = std::env::var("TERMRELAY_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!(%level, "overriding log level from environment");
                self.client.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = &self.relay.endpoint;
        if endpoint.is_empty()
            || endpoint.contains("://")
            || endpoint.contains('/')
            || endpoint.chars().any(char::is_whitespace)
        {
            return Err(ConfigError::InvalidEndpoint(endpoint.clone()));
        }

        if self.relay.connect_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("connect_timeout_secs"));
        }
        if self.relay.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ZeroTimeout("heartbeat_interval_secs"));
        }
        if self.relay.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("heartbeat_timeout_secs"));
        }

        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::ZeroBaseDelay);
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::MaxDelayBelowBase {
                base: self.reconnect.base_delay_ms,
                max: self.reconnect.max_delay_ms,
            });
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }

        let level = self.client.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.client.log_level.clone()));
        }

        Ok(())
    }

    /// Builds the runtime client configuration from these settings.
    pub fn client_config(&self) -> RelayClientConfig {
        let policy = ReconnectPolicy::new(
            Duration::from_millis(self.reconnect.base_delay_ms),
            Duration::from_millis(self.reconnect.max_delay_ms),
            self.reconnect.max_attempts,
        );
        RelayClientConfig::default()
            .with_secure(self.relay.secure)
            .with_auto_reconnect(self.reconnect.auto_reconnect)
            .with_reconnect_policy(policy)
            .with_connect_timeout(Duration::from_secs(self.relay.connect_timeout_secs))
            .with_heartbeat(
                Duration::from_secs(self.relay.heartbeat_interval_secs),
                Duration::from_secs(self.relay.heartbeat_timeout_secs),
            )
    }

    /// Path of the key file inside the data directory.
    pub fn key_file(&self) -> PathBuf {
        self.client.data_dir.join(KEY_FILE_NAME)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
