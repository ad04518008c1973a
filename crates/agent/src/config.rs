//! Configuration module for the agent node
//!
//! Supports YAML configuration files with module-based organization

use push_core::coord::PilotStoreConfig;
use push_core::types::NodeMeta;
use push_core::ClusterConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub coord: CoordConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
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

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.is_empty() {
            return Err(ConfigError::Invalid("node.name is empty".to_string()));
        }
        if self.network.rpc_bind.is_empty() {
            return Err(ConfigError::Invalid("network.rpc_bind is empty".to_string()));
        }
        if self.coord.migrate_lock.is_empty() {
            return Err(ConfigError::Invalid("coord.migrate_lock is empty".to_string()));
        }
        Ok(())
    }

    /// Registration payload: rpc addresses and weight only
    pub fn node_meta(&self) -> NodeMeta {
        NodeMeta {
            rpc: self.network.rpc_bind.clone(),
            weight: self.node.weight.max(1),
            ..Default::default()
        }
    }

    /// Watch settings of the comet cluster
    pub fn comet_cluster(&self) -> ClusterConfig {
        ClusterConfig {
            root: self.coord.comet_path.clone(),
            migrate_lock: self.coord.migrate_lock.clone(),
            retry: self.rpc.retry(),
            ping: self.rpc.ping(),
            ..Default::default()
        }
    }

    /// Watch settings of the message nodes
    pub fn message_cluster(&self) -> ClusterConfig {
        ClusterConfig {
            root: self.coord.message_path.clone(),
            retry: self.rpc.retry(),
            ping: self.rpc.ping(),
            ..Default::default()
        }
    }
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub weight: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node1".to_string(),
            weight: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub rpc_bind: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_bind: vec!["localhost:7070".to_string()],
        }
    }
}

/// Coordination store layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    pub pilot: PilotStoreConfig,
    pub comet_path: String,
    pub message_path: String,
    pub agent_path: String,
    /// Ephemeral node guarding a migration round
    pub migrate_lock: String,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            pilot: PilotStoreConfig::default(),
            comet_path: "/gopush-cluster-comet".to_string(),
            message_path: "/gopush-cluster-message".to_string(),
            agent_path: "/gopush-cluster-agent".to_string(),
            migrate_lock: "/gopush-migrate-lock".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Ping interval (milliseconds)
    pub ping_ms: u64,
    /// Redial delay after a failed ping (milliseconds)
    pub retry_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            ping_ms: 1000,
            retry_ms: 3000,
        }
    }
}

impl RpcConfig {
    pub fn ping(&self) -> Duration {
        Duration::from_millis(self.ping_ms)
    }

    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }
}

/// Conversation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of a stored user message (seconds)
    pub user_msg_expire: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_msg_expire: 36000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
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
