//! Configuration module for the comet node
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
    pub channel: ChannelConfig,
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

    /// Merge with another config (other takes precedence)
    pub fn merge(&mut self, other: Config) {
        self.node.merge(other.node);
        self.network.merge(other.network);
        self.coord.merge(other.coord);
        self.rpc.merge(other.rpc);
        self.channel.merge(other.channel);
        self.log.merge(other.log);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.is_empty() {
            return Err(ConfigError::Invalid("node.name is empty".to_string()));
        }
        if self.network.rpc_bind.is_empty() {
            return Err(ConfigError::Invalid("network.rpc_bind is empty".to_string()));
        }
        if self.network.tcp_bind.is_empty() && self.network.ws_bind.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one tcp or websocket bind is required".to_string(),
            ));
        }
        if self.channel.max_subscribers == 0 || self.channel.msgbuf == 0 {
            return Err(ConfigError::Invalid(
                "channel.max_subscribers and channel.msgbuf must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Registration payload advertised to the cluster
    pub fn node_meta(&self) -> NodeMeta {
        NodeMeta {
            rpc: self.network.rpc_bind.clone(),
            tcp: self.network.tcp_bind.clone(),
            ws: self.network.ws_bind.clone(),
            weight: self.node.weight.max(1),
        }
    }

    /// Watch settings for the agent or message root
    pub fn backend_cluster(&self, root: &str) -> ClusterConfig {
        ClusterConfig {
            root: root.to_string(),
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
    /// Node id, also the ring member name
    pub name: String,
    /// Ring and load balancing weight
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

impl NodeConfig {
    fn merge(&mut self, other: Self) {
        if !other.name.is_empty() {
            self.name = other.name;
        }
        if other.weight > 0 {
            self.weight = other.weight;
        }
    }
}

/// Listen addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub tcp_bind: Vec<String>,
    pub ws_bind: Vec<String>,
    pub rpc_bind: Vec<String>,
    pub tcp_keepalive: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp_bind: vec!["localhost:6969".to_string()],
            ws_bind: vec!["localhost:6968".to_string()],
            rpc_bind: vec!["localhost:6970".to_string()],
            tcp_keepalive: false,
        }
    }
}

impl NetworkConfig {
    fn merge(&mut self, other: Self) {
        if !other.tcp_bind.is_empty() {
            self.tcp_bind = other.tcp_bind;
        }
        if !other.ws_bind.is_empty() {
            self.ws_bind = other.ws_bind;
        }
        if !other.rpc_bind.is_empty() {
            self.rpc_bind = other.rpc_bind;
        }
        self.tcp_keepalive |= other.tcp_keepalive;
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
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            pilot: PilotStoreConfig::default(),
            comet_path: "/gopush-cluster-comet".to_string(),
            message_path: "/gopush-cluster-message".to_string(),
            agent_path: "/gopush-cluster-agent".to_string(),
        }
    }
}

impl CoordConfig {
    fn merge(&mut self, other: Self) {
        if !other.pilot.pilot_addr.is_empty() {
            self.pilot = other.pilot;
        }
        if !other.comet_path.is_empty() {
            self.comet_path = other.comet_path;
        }
        if !other.message_path.is_empty() {
            self.message_path = other.message_path;
        }
        if !other.agent_path.is_empty() {
            self.agent_path = other.agent_path;
        }
    }
}

/// Backend pool probing
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
            retry_ms: 1000,
        }
    }
}

impl RpcConfig {
    fn merge(&mut self, other: Self) {
        if other.ping_ms > 0 {
            self.ping_ms = other.ping_ms;
        }
        if other.retry_ms > 0 {
            self.retry_ms = other.retry_ms;
        }
    }

    pub fn ping(&self) -> Duration {
        Duration::from_millis(self.ping_ms)
    }

    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }
}

/// Channel limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Most connections one key may hold
    pub max_subscribers: usize,
    /// Outbound queue capacity per connection
    pub msgbuf: usize,
    /// Number of channel buckets
    pub bucket_count: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_subscribers: 64,
            msgbuf: 30,
            bucket_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl ChannelConfig {
    fn merge(&mut self, other: Self) {
        if other.max_subscribers > 0 {
            self.max_subscribers = other.max_subscribers;
        }
        if other.msgbuf > 0 {
            self.msgbuf = other.msgbuf;
        }
        if other.bucket_count > 0 {
            self.bucket_count = other.bucket_count;
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

impl LogConfig {
    fn merge(&mut self, other: Self) {
        if !other.level.is_empty() {
            self.level = other.level;
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
