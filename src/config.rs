//! Configuration System
//!
//! Handles loading and saving the settings file and environment variable
//! overrides. The file holds the broker settings, normalizer tuning, logging
//! and the persisted feed list.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::connection::{ConnectionConfig, ManagerOptions};
use crate::signal::DEFAULT_FIELD_PRIORITY;

/// Topic of the feed created when none are saved
pub const DEFAULT_FEED_TOPIC: &str = "wvu-mae411L/group_1";

/// Label of the feed created when none are saved
pub const DEFAULT_FEED_LABEL: &str = "Group 1 Temperature";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: ConnectionConfig,

    #[serde(default)]
    pub manager: ManagerOptions,

    #[serde(default)]
    pub normalizer: NormalizerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

/// Payload normalizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Fields searched, in order, before scanning the whole record
    #[serde(default = "default_field_priority")]
    pub field_priority: Vec<String>,
}

fn default_field_priority() -> Vec<String> {
    DEFAULT_FIELD_PRIORITY.iter().map(|f| f.to_string()).collect()
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            field_priority: default_field_priority(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

/// A persisted feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub topic: String,

    #[serde(default)]
    pub label: String,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Write the configuration to a file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize {
            error: e.to_string(),
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                error: e.to_string(),
            })?;
        }

        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        tracing::debug!(path = %path.display(), "Saved config");
        Ok(())
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path` if it exists, else defaults; environment always applies
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let config = Self::load_with_env(path)?;
            tracing::info!(path = %path.display(), "Loaded config");
            Ok(config)
        } else {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            Ok(Self::from_env())
        }
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [default_path(), Some(PathBuf::from("./telegauge.toml"))];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to load config");
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Add the default feed when none are configured; returns whether it did
    pub fn ensure_default_feed(&mut self) -> bool {
        if !self.feeds.is_empty() {
            return false;
        }
        self.feeds.push(FeedConfig {
            topic: DEFAULT_FEED_TOPIC.to_string(),
            label: DEFAULT_FEED_LABEL.to_string(),
        });
        true
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("TELEGAUGE_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Ok(port) = std::env::var("TELEGAUGE_BROKER_PORT") {
            match port.parse() {
                Ok(p) => self.broker.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid TELEGAUGE_BROKER_PORT"),
            }
        }
        if let Ok(scheme) = std::env::var("TELEGAUGE_BROKER_SCHEME") {
            match scheme.parse() {
                Ok(s) => self.broker.scheme = s,
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid TELEGAUGE_BROKER_SCHEME"),
            }
        }
        if let Ok(client_id) = std::env::var("TELEGAUGE_CLIENT_ID") {
            self.broker.client_id = client_id;
        }

        if let Ok(level) = std::env::var("TELEGAUGE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TELEGAUGE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// `<config dir>/telegauge/config.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("telegauge").join("config.toml"))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Failed to serialize config: {error}")]
    Serialize { error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Telegauge Configuration
#
# Environment variables override these settings:
# - TELEGAUGE_BROKER_HOST
# - TELEGAUGE_BROKER_PORT
# - TELEGAUGE_BROKER_SCHEME
# - TELEGAUGE_CLIENT_ID
# - TELEGAUGE_LOG_LEVEL
# - TELEGAUGE_LOG_FORMAT

[broker]
host = "broker.emqx.io"
port = 8083

# tcp, ssl, ws or wss
scheme = "ws"

# Request path for ws/wss
path = "/mqtt"

# Leave unset to generate telegauge_<6 hex chars> on each start
# client_id = "telegauge_123abc"

keep_alive_secs = 60
connect_timeout_secs = 30

# Delay before retrying a lost connection (0 disables retries)
reconnect_period_ms = 5000
clean_session = true

[manager]
# Subscriptions replayed per batch after a reconnect
replay_chunk_size = 50

[normalizer]
# Fields checked, in order, in JSON payloads before any other numeric field
field_priority = ["temperature", "temp", "value", "data"]

[logging]
# trace, debug, info, warn or error
level = "info"

# pretty or json
format = "pretty"

[[feeds]]
topic = "wvu-mae411L/group_1"
label = "Group 1 Temperature"
"#
    .to_string()
}
