//! Cluster membership
//!
//! Watch loops turn coordination store changes into [`MembershipEvent`]s; a
//! single consumer task applies them and publishes a fresh
//! [`ClusterSnapshot`] (node map, ring and pool built together) with one
//! atomic pointer swap. Readers load the snapshot without locking.
//!
//! # Components
//! - [`ClusterState`]: comet membership, leader selection, migration trigger
//! - [`MigrationCoordinator`]: lock guarded `Migrate` broadcast
//! - [`BackendWatcher`]: address keyed pools for agent and message nodes
//! - [`register_node`] / [`register_backend`]: self registration

pub mod backend;
pub mod migration;
pub mod register;
pub mod watcher;

pub use backend::BackendWatcher;
pub use migration::{MigrationCoordinator, MigrationOutcome};
pub use register::{advertised, register_backend, register_node};
pub use watcher::ClusterState;

use crate::pool::WeightedPool;
use crate::ring::Ring;
use crate::rpc::RpcClient;
use crate::types::{NodeMeta, COMET_SERVICE};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Capacity of the membership event queue
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Watch settings for one node class
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Root path holding one child per node
    pub root: String,
    /// Ephemeral node used as the migration lock
    pub migrate_lock: String,
    /// Delay before redialing a failed pool member
    pub retry: Duration,
    /// Pool ping interval
    pub ping: Duration,
    /// Delay before re-reading a missing or empty path
    pub wait_delay: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            root: "/gopush-cluster-comet".to_string(),
            migrate_lock: "/gopush-migrate-lock".to_string(),
            retry: Duration::from_secs(3),
            ping: Duration::from_secs(1),
            wait_delay: Duration::from_secs(1),
        }
    }
}

/// One cluster member as currently known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: String,
    /// Registration payload of the elected leader, default until one is read
    pub meta: NodeMeta,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: NodeMeta::default(),
        }
    }

    pub fn weight(&self) -> u32 {
        self.meta.weight.max(1)
    }

    /// First advertised rpc address
    pub fn rpc_addr(&self) -> Option<&str> {
        self.meta.rpc.first().map(String::as_str)
    }
}

/// Immutable view of the cluster published by the single writer
#[derive(Debug)]
pub struct ClusterSnapshot {
    nodes: HashMap<String, NodeInfo>,
    ring: Ring,
    pool: WeightedPool,
}

impl ClusterSnapshot {
    pub fn empty() -> Self {
        Self {
            nodes: HashMap::new(),
            ring: Ring::default(),
            pool: WeightedPool::empty(COMET_SERVICE),
        }
    }

    pub(crate) fn new(nodes: HashMap<String, NodeInfo>, ring: Ring, pool: WeightedPool) -> Self {
        Self { nodes, ring, pool }
    }

    pub fn nodes(&self) -> &HashMap<String, NodeInfo> {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&NodeInfo> {
        self.nodes.get(id)
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn pool(&self) -> &WeightedPool {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node id to weight, the argument of a `Migrate` call
    pub fn weights(&self) -> HashMap<String, u32> {
        self.nodes
            .values()
            .map(|n| (n.id.clone(), n.weight()))
            .collect()
    }

    /// Node owning `key`
    pub fn route(&self, key: &str) -> Option<&NodeInfo> {
        let id = self.ring.hash(key)?;
        self.nodes.get(id)
    }

    /// Live rpc handle of the node owning `key`
    pub fn client_for(&self, key: &str) -> Option<(&NodeInfo, Option<RpcClient>)> {
        let node = self.route(key)?;
        Some((node, self.pool.get_by_id(&node.id)))
    }
}

/// What happened to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Removed,
    Updated,
}

/// Membership change produced by a watch loop
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    NodeAdded(String),
    NodeRemoved(String),
    /// New leader payload; `client` is a freshly dialed handle, `None` when
    /// the published one is still valid
    NodeUpdated {
        id: String,
        meta: NodeMeta,
        client: Option<RpcClient>,
    },
}

impl MembershipEvent {
    pub fn id(&self) -> &str {
        match self {
            MembershipEvent::NodeAdded(id) | MembershipEvent::NodeRemoved(id) => id,
            MembershipEvent::NodeUpdated { id, .. } => id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            MembershipEvent::NodeAdded(_) => EventKind::Added,
            MembershipEvent::NodeRemoved(_) => EventKind::Removed,
            MembershipEvent::NodeUpdated { .. } => EventKind::Updated,
        }
    }
}

/// Sleep for `delay`; false when cancelled first
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolMember;

    #[test]
    fn test_empty_snapshot_routes_nowhere() {
        let snapshot = ClusterSnapshot::empty();
        assert!(snapshot.route("key").is_none());
        assert!(snapshot.client_for("key").is_none());
    }

    #[test]
    fn test_route_follows_ring() {
        let mut nodes = HashMap::new();
        for id in ["11", "22"] {
            nodes.insert(id.to_string(), NodeInfo::new(id));
        }
        let weights: HashMap<String, u32> = nodes.keys().map(|k| (k.clone(), 1)).collect();
        let ring = Ring::from_weights(&weights);
        let pool = WeightedPool::new(
            COMET_SERVICE,
            vec![PoolMember::new("11", "", 1), PoolMember::new("22", "", 1)],
            Duration::from_secs(1),
            Duration::from_secs(1),
            false,
        );
        let snapshot = ClusterSnapshot::new(nodes, ring, pool);

        let owner = snapshot.route("lucas-chi333").unwrap();
        assert_eq!(owner.id, "11");
        let (_, client) = snapshot.client_for("lucas-chi333").unwrap();
        assert!(client.is_none());
        assert_eq!(snapshot.weights().len(), 2);
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(MembershipEvent::NodeAdded("a".into()).kind(), EventKind::Added);
        let ev = MembershipEvent::NodeUpdated {
            id: "a".into(),
            meta: NodeMeta::default(),
            client: None,
        };
        assert_eq!(ev.kind(), EventKind::Updated);
        assert_eq!(ev.id(), "a");
    }
}
