//! Coordination store client
//!
//! Hierarchical paths with persistent, ephemeral and sequential nodes plus
//! version based change notification. Used for membership registration and
//! for the migration lock.
//!
//! # Implementations
//! - [`MemoryStore`]: in-process tree, one session per handle
//! - [`PilotStore`]: HTTP client of the pilot coordination service

pub mod memory;
pub mod pilot;
pub mod tree;

pub use memory::MemoryStore;
pub use pilot::{PilotStore, PilotStoreConfig};
pub use tree::{PersistedNode, Tree, WatchKind};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Coordination store error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    #[error("node does not exist: {0}")]
    NoNode(String),
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("node has children: {0}")]
    NotEmpty(String),
    #[error("ephemeral node cannot have children: {0}")]
    EphemeralParent(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("session expired")]
    SessionExpired,
    #[error("transport error: {0}")]
    Transport(String),
}

impl CoordError {
    /// Stable code used on the pilot HTTP API
    pub fn code(&self) -> &'static str {
        match self {
            CoordError::NoNode(_) => "no_node",
            CoordError::NodeExists(_) => "node_exists",
            CoordError::NotEmpty(_) => "not_empty",
            CoordError::EphemeralParent(_) => "ephemeral_parent",
            CoordError::InvalidPath(_) => "invalid_path",
            CoordError::SessionExpired => "session_expired",
            CoordError::Transport(_) => "transport",
        }
    }

    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            "no_node" => CoordError::NoNode(message),
            "node_exists" => CoordError::NodeExists(message),
            "not_empty" => CoordError::NotEmpty(message),
            "ephemeral_parent" => CoordError::EphemeralParent(message),
            "invalid_path" => CoordError::InvalidPath(message),
            "session_expired" => CoordError::SessionExpired,
            _ => CoordError::Transport(message),
        }
    }
}

pub type CoordResult<T> = std::result::Result<T, CoordError>;

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
    /// Ephemeral, with a 10 digit sequence suffix appended to the name
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        !matches!(self, CreateMode::Persistent)
    }
}

/// Child list of a path together with its child version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Children {
    /// Sorted child names
    pub names: Vec<String>,
    pub version: u64,
}

/// Coordination store operations
#[async_trait]
pub trait CoordStore: Send + Sync + 'static {
    /// Children of `path`; `NoNode` when the path is missing
    async fn children(&self, path: &str) -> CoordResult<Children>;

    /// Block until the child version of `path` differs from `version`
    async fn wait_children(&self, path: &str, version: u64) -> CoordResult<u64>;

    /// Data and data version of `path`
    async fn get(&self, path: &str) -> CoordResult<(Vec<u8>, u64)>;

    /// Block until the data version of `path` differs from `version`
    async fn wait_data(&self, path: &str, version: u64) -> CoordResult<u64>;

    /// Overwrite the data of an existing node
    async fn set(&self, path: &str, data: &[u8]) -> CoordResult<u64>;

    /// Create a node, returning its actual path
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String>;

    async fn delete(&self, path: &str) -> CoordResult<()>;

    async fn exists(&self, path: &str) -> CoordResult<bool>;
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of an absolute path, `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Create `path` and every missing ancestor as persistent nodes
pub async fn create_parents<S: CoordStore + ?Sized>(store: &S, path: &str) -> CoordResult<()> {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        match store.create(&current, &[], CreateMode::Persistent).await {
            Ok(_) | Err(CoordError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
