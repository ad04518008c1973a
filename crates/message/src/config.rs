//! Configuration module for the message node
//!
//! Supports YAML configuration files with module-based organization

use push_core::coord::PilotStoreConfig;
use push_core::types::NodeMeta;
use serde::{Deserialize, Serialize};

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
    pub storage: StorageConfig,
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
        if self.storage.max_store == 0 {
            return Err(ConfigError::Invalid("storage.max_store must be positive".to_string()));
        }
        if self.storage.delete_queue == 0 {
            return Err(ConfigError::Invalid(
                "storage.delete_queue must be positive".to_string(),
            ));
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
            rpc_bind: vec!["localhost:8070".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    pub pilot: PilotStoreConfig,
    pub message_path: String,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            pilot: PilotStoreConfig::default(),
            message_path: "/gopush-cluster-message".to_string(),
        }
    }
}

/// Storage limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Newest messages kept per key
    pub max_store: usize,
    /// Capacity of the expired-entry delete queue
    pub delete_queue: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_store: 20,
            delete_queue: 10240,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.rpc_bind, vec!["localhost:8070"]);
        assert_eq!(config.coord.message_path, "/gopush-cluster-message");
        assert_eq!(config.storage.max_store, 20);
        assert_eq!(config.storage.delete_queue, 10240);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml() {
        let yaml = r#"
node:
  name: m2
  weight: 4
storage:
  max_store: 5
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.node.name, "m2");
        assert_eq!(config.storage.max_store, 5);
        assert_eq!(config.storage.delete_queue, 10240);
        assert_eq!(config.node_meta().weight, 4);
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.storage.max_store = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
