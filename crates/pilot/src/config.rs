//! Pilot configuration
//!
//! YAML file, overridden by command line flags

use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Pilot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PilotConfig {
    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// HTTP API listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Persistence interval (seconds)
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
    /// Longest hold of a watch request (milliseconds)
    #[serde(default = "default_watch_max_wait_ms")]
    pub watch_max_wait_ms: u64,
    #[serde(default)]
    pub session: SessionConfig,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            http_addr: default_http_addr(),
            save_interval_secs: default_save_interval_secs(),
            watch_max_wait_ms: default_watch_max_wait_ms(),
            session: SessionConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl PilotConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(&mut self, other: PilotConfig) {
        if !other.data_dir.as_os_str().is_empty() {
            self.data_dir = other.data_dir;
        }
        if !other.http_addr.is_empty() {
            self.http_addr = other.http_addr;
        }
        if other.save_interval_secs > 0 {
            self.save_interval_secs = other.save_interval_secs;
        }
        if other.watch_max_wait_ms > 0 {
            self.watch_max_wait_ms = other.watch_max_wait_ms;
        }
        self.session.merge(other.session);
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_addr.is_empty() {
            return Err(ConfigError::Invalid("http_addr is empty".to_string()));
        }
        if self.save_interval_secs == 0 {
            return Err(ConfigError::Invalid("save_interval_secs must be positive".to_string()));
        }
        if self.session.default_ttl_secs == 0 || self.session.default_ttl_secs > self.session.max_ttl_secs {
            return Err(ConfigError::Invalid(
                "session.default_ttl_secs must be within 1..=max_ttl_secs".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./pilot_data")
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_save_interval_secs() -> u64 {
    60
}

fn default_watch_max_wait_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
