//! Push cluster core
//!
//! Shared building blocks of the comet, agent and message nodes.
//!
//! # Features
//! - Weighted consistent-hash ring mapping subscriber keys to comet nodes
//! - Multiplexed JSON RPC over length-delimited TCP frames
//! - Weighted random RPC pool with ping probing and reconnect
//! - Coordination store client (in-memory and pilot HTTP backends)
//! - Membership watcher publishing atomic (nodes, ring, pool) snapshots
//! - Lock guarded migration broadcast
//!
//! # Usage Example
//! ```ignore
//! use push_core::cluster::{ClusterConfig, ClusterState};
//!
//! let state = ClusterState::new(store, ClusterConfig::default());
//! state.start(cancel.clone());
//! if let Some((node, Some(client))) = state.snapshot().client_for("user-1") {
//!     client.call::<_, serde_json::Value>(COMET_PUSH_PRIVATE, &args).await?;
//! }
//! ```

pub mod cluster;
pub mod coord;
pub mod error;
pub mod id;
pub mod pool;
pub mod ring;
pub mod rpc;
pub mod types;

pub use cluster::{
    BackendWatcher, ClusterConfig, ClusterSnapshot, ClusterState, MembershipEvent,
    MigrationCoordinator, MigrationOutcome, NodeInfo, advertised, register_backend, register_node,
};
pub use coord::{CoordError, CoordStore, CreateMode, MemoryStore, PilotStore, PilotStoreConfig};
pub use error::{PushError, Result};
pub use id::next_id;
pub use pool::{PoolMember, WeightedPool};
pub use ring::Ring;
pub use rpc::{RpcClient, RpcService};
