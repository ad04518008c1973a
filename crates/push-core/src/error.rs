//! Error taxonomy shared by every push cluster crate

use crate::coord::CoordError;

/// Push cluster error
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// Malformed client or RPC input
    #[error("parameter error: {0}")]
    Parameter(String),
    /// No owning node, or the owner is unreachable
    #[error("routing error: {0}")]
    Routing(String),
    /// Malformed wire frame
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Channel already holds the maximum number of subscribers
    #[error("channel exceeds max subscribers ({0})")]
    Capacity(usize),
    /// Persistence backend failure
    #[error("storage error: {0}")]
    Storage(String),
    /// Another migration round holds the cluster lock
    #[error("migration lock is held by another node")]
    LockContention,
    /// Remote call failed (timeout, refused, broken connection, remote error)
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("coordination error: {0}")]
    Coord(#[from] CoordError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PushError {
    /// Short machine readable kind, carried across RPC boundaries
    pub fn kind(&self) -> &'static str {
        match self {
            PushError::Parameter(_) => "parameter",
            PushError::Routing(_) => "routing",
            PushError::Protocol(_) => "protocol",
            PushError::Capacity(_) => "capacity",
            PushError::Storage(_) => "storage",
            PushError::LockContention => "lock",
            PushError::Rpc(_) => "rpc",
            PushError::Coord(_) => "coord",
            PushError::Io(_) => "io",
            PushError::Json(_) => "json",
        }
    }

    /// Rebuild an error received from a remote peer
    pub fn from_remote(kind: &str, message: String) -> Self {
        match kind {
            "parameter" => PushError::Parameter(message),
            "routing" => PushError::Routing(message),
            "storage" => PushError::Storage(message),
            _ => PushError::Rpc(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, PushError>;
