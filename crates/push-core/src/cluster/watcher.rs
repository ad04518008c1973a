//! Comet membership watcher
//!
//! One root watch emits adds and removals, one watch per node elects the
//! smallest registration as leader and emits updates. A single consumer
//! applies events in order and swaps in a new snapshot after each one.

use super::{
    sleep_or_cancel, ClusterConfig, ClusterSnapshot, EventKind, MembershipEvent,
    MigrationCoordinator, MigrationOutcome, NodeInfo, EVENT_QUEUE_CAPACITY,
};
use crate::coord::{join_path, CoordError, CoordStore};
use crate::error::{PushError, Result};
use crate::pool::{PoolMember, WeightedPool};
use crate::ring::Ring;
use crate::rpc::RpcClient;
use crate::types::{NodeMeta, COMET_SERVICE};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owner of the published comet cluster view
pub struct ClusterState {
    config: ClusterConfig,
    store: Arc<dyn CoordStore>,
    current: ArcSwap<ClusterSnapshot>,
    migration: MigrationCoordinator,
    /// Cancels the leader watch of each known node
    node_watches: Mutex<HashMap<String, CancellationToken>>,
}

impl ClusterState {
    pub fn new(store: Arc<dyn CoordStore>, config: ClusterConfig) -> Arc<Self> {
        let migration =
            MigrationCoordinator::new(store.clone(), &config.root, &config.migrate_lock);
        Arc::new(Self {
            config,
            store,
            current: ArcSwap::from_pointee(ClusterSnapshot::empty()),
            migration,
            node_watches: Mutex::new(HashMap::new()),
        })
    }

    /// Currently published view
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.current.load_full()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Spawn the root watch and the event consumer
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        tokio::spawn(self.clone().watch_root(tx.clone(), cancel.clone()));
        tokio::spawn(self.clone().consume(rx, tx, cancel))
    }

    /// Apply one event and publish the result
    ///
    /// Only the consumer task calls this. Returns `None` when the event does
    /// not change the membership (duplicate add, stale remove or update).
    pub(crate) fn apply(&self, event: MembershipEvent) -> Option<Arc<ClusterSnapshot>> {
        let old = self.current.load_full();
        let mut nodes = old.nodes().clone();
        let mut fresh: Option<(String, RpcClient)> = None;

        match event {
            MembershipEvent::NodeAdded(id) => {
                if nodes.contains_key(&id) {
                    return None;
                }
                info!("Add node {}", id);
                nodes.insert(id.clone(), NodeInfo::new(id));
            }
            MembershipEvent::NodeRemoved(id) => {
                if nodes.remove(&id).is_none() {
                    return None;
                }
                info!("Remove node {}", id);
            }
            MembershipEvent::NodeUpdated { id, meta, client } => {
                let Some(node) = nodes.get_mut(&id) else {
                    if let Some(client) = client {
                        client.close();
                    }
                    return None;
                };
                info!("Update node {}", id);
                node.meta = meta;
                if let Some(client) = client {
                    fresh = Some((id, client));
                }
            }
        }

        let mut handles: HashMap<String, RpcClient> = old
            .pool()
            .members()
            .into_iter()
            .filter_map(|m| m.client.map(|c| (m.id, c)))
            .collect();
        if let Some((id, client)) = fresh {
            handles.insert(id, client);
        }

        let mut members = Vec::with_capacity(nodes.len());
        for node in nodes.values() {
            let mut member =
                PoolMember::new(&node.id, node.rpc_addr().unwrap_or_default(), node.weight());
            if let Some(client) = handles.remove(&node.id) {
                member = member.with_client(client);
            }
            members.push(member);
        }

        let weights: HashMap<String, u32> =
            nodes.values().map(|n| (n.id.clone(), n.weight())).collect();
        let ring = Ring::from_weights(&weights);
        let pool = WeightedPool::new(
            COMET_SERVICE,
            members,
            self.config.retry,
            self.config.ping,
            true,
        );
        let snapshot = Arc::new(ClusterSnapshot::new(nodes, ring, pool));
        self.current.store(snapshot.clone());
        // superseded handles and those of removed nodes are closed here;
        // holders of the old snapshot keep every shared one
        old.pool().retire(snapshot.pool());
        debug!("Cluster now has {} nodes", snapshot.len());
        Some(snapshot)
    }

    async fn consume(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<MembershipEvent>,
        tx: mpsc::Sender<MembershipEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let id = event.id().to_string();
            let kind = event.kind();

            let Some(snapshot) = self.apply(event) else {
                continue;
            };
            match kind {
                EventKind::Added => {
                    self.start_node_watch(&id, tx.clone(), &cancel);
                    continue;
                }
                EventKind::Removed => self.stop_node_watch(&id),
                EventKind::Updated => {}
            }

            match self
                .migration
                .notify(&snapshot, &id, kind == EventKind::Updated)
                .await
            {
                Ok(MigrationOutcome::Skipped) => debug!("Ignore migration for node {}", id),
                Ok(MigrationOutcome::Completed { notified, total }) if notified < total => {
                    warn!("Migration for node {} reached {}/{} nodes", id, notified, total)
                }
                Ok(_) => {}
                Err(e) => error!("Migration for node {} failed: {}", id, e),
            }
        }

        for (_, token) in self.node_watches.lock().drain() {
            token.cancel();
        }
        self.current.load().pool().destroy();
        info!("Cluster watcher for {} stopped", self.config.root);
    }

    async fn watch_root(self: Arc<Self>, tx: mpsc::Sender<MembershipEvent>, cancel: CancellationToken) {
        let root = self.config.root.clone();
        loop {
            let children = match self.store.children(&root).await {
                Ok(children) => children,
                Err(CoordError::NoNode(_)) => {
                    warn!("Path {} does not exist, retry in {:?}", root, self.config.wait_delay);
                    if !sleep_or_cancel(self.config.wait_delay, &cancel).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!("Read children of {} failed: {}", root, e);
                    if !sleep_or_cancel(self.config.wait_delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let known = self.snapshot();
            if children.names.is_empty() {
                warn!("Path {} has no children, retry in {:?}", root, self.config.wait_delay);
                for id in known.nodes().keys() {
                    if tx.send(MembershipEvent::NodeRemoved(id.clone())).await.is_err() {
                        return;
                    }
                }
                if !sleep_or_cancel(self.config.wait_delay, &cancel).await {
                    break;
                }
                continue;
            }

            let present: HashSet<&str> = children.names.iter().map(String::as_str).collect();
            for id in &children.names {
                if known.node(id).is_none()
                    && tx.send(MembershipEvent::NodeAdded(id.clone())).await.is_err()
                {
                    return;
                }
            }
            for id in known.nodes().keys() {
                if !present.contains(id.as_str())
                    && tx.send(MembershipEvent::NodeRemoved(id.clone())).await.is_err()
                {
                    return;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.store.wait_children(&root, children.version) => match res {
                    Ok(version) => debug!("Path {} changed, version {}", root, version),
                    Err(e) => {
                        warn!("Watch {} failed: {}", root, e);
                        if !sleep_or_cancel(self.config.wait_delay, &cancel).await {
                            break;
                        }
                    }
                },
            }
        }
        debug!("Root watch {} stopped", root);
    }

    fn start_node_watch(
        self: &Arc<Self>,
        id: &str,
        tx: mpsc::Sender<MembershipEvent>,
        cancel: &CancellationToken,
    ) {
        let token = cancel.child_token();
        if let Some(previous) = self.node_watches.lock().insert(id.to_string(), token.clone()) {
            previous.cancel();
        }
        tokio::spawn(self.clone().watch_node(id.to_string(), tx, token));
    }

    fn stop_node_watch(&self, id: &str) {
        if let Some(token) = self.node_watches.lock().remove(id) {
            token.cancel();
        }
    }

    async fn watch_node(
        self: Arc<Self>,
        id: String,
        tx: mpsc::Sender<MembershipEvent>,
        cancel: CancellationToken,
    ) {
        let path = join_path(&self.config.root, &id);
        loop {
            let children = match self.store.children(&path).await {
                Ok(children) => children,
                Err(CoordError::NoNode(_)) => {
                    warn!("Path {} is gone, stop watching until it is recreated", path);
                    break;
                }
                Err(e) => {
                    error!("Read children of {} failed: {}", path, e);
                    if !sleep_or_cancel(self.config.wait_delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            };
            let Some(leader) = children.names.first() else {
                warn!("Path {} has no children, retry in {:?}", path, self.config.wait_delay);
                if !sleep_or_cancel(self.config.wait_delay, &cancel).await {
                    break;
                }
                continue;
            };

            match self.load_leader(&id, &join_path(&path, leader)).await {
                Ok((meta, client)) => {
                    let event = MembershipEvent::NodeUpdated {
                        id: id.clone(),
                        meta,
                        client,
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Load leader {} of {} failed: {}", leader, path, e);
                    if !sleep_or_cancel(self.config.wait_delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.store.wait_children(&path, children.version) => {
                    if let Err(e) = res {
                        warn!("Watch {} failed: {}", path, e);
                        if !sleep_or_cancel(self.config.wait_delay, &cancel).await {
                            break;
                        }
                    }
                }
            }
        }
        debug!("Node watch {} stopped", path);
    }

    /// Read the leader payload and dial it unless the published handle
    /// already points at the same address
    async fn load_leader(&self, id: &str, path: &str) -> Result<(NodeMeta, Option<RpcClient>)> {
        let (data, _) = self.store.get(path).await?;
        let meta = NodeMeta::from_slice(&data)?;
        let Some(addr) = meta.rpc.first() else {
            return Err(PushError::Routing(format!("{} has no rpc address", path)));
        };

        let live = self.snapshot().pool().get_by_id(id);
        if live.as_ref().is_some_and(|c| c.addr() == addr) {
            return Ok((meta, None));
        }
        let client = RpcClient::dial(addr).await?;
        debug!("Node {} dialed {}", id, addr);
        Ok((meta, Some(client)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryStore;
    use crate::rpc::{encode_reply, serve, unknown_method, RpcService};
    use async_trait::async_trait;
    use tokio::net::TcpListener;

    struct Comet;

    #[async_trait]
    impl RpcService for Comet {
        async fn call(&self, method: &str, _body: serde_json::Value) -> Result<serde_json::Value> {
            match method {
                "CometRPC.Ping" => encode_reply(&0),
                other => Err(unknown_method(other)),
            }
        }
    }

    async fn comet(cancel: &CancellationToken) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve(listener, Arc::new(Comet), cancel.clone()));
        addr
    }

    fn update(id: &str, addr: &str, client: RpcClient) -> MembershipEvent {
        MembershipEvent::NodeUpdated {
            id: id.into(),
            meta: NodeMeta {
                rpc: vec![addr.to_string()],
                weight: 1,
                ..Default::default()
            },
            client: Some(client),
        }
    }

    fn state() -> Arc<ClusterState> {
        ClusterState::new(Arc::new(MemoryStore::new()), ClusterConfig::default())
    }

    fn assert_consistent(snapshot: &ClusterSnapshot) {
        let mut pool_ids = snapshot.pool().ids();
        pool_ids.sort();
        let mut ring_ids: Vec<String> = snapshot.ring().weights().into_keys().collect();
        ring_ids.sort();
        let mut node_ids: Vec<String> = snapshot.nodes().keys().cloned().collect();
        node_ids.sort();
        assert_eq!(pool_ids, node_ids);
        assert_eq!(ring_ids, node_ids);
    }

    #[tokio::test]
    async fn test_apply_add_update_remove() {
        let state = state();
        state.apply(MembershipEvent::NodeAdded("n1".into())).unwrap();
        state.apply(MembershipEvent::NodeAdded("n2".into())).unwrap();
        assert!(state.apply(MembershipEvent::NodeAdded("n1".into())).is_none());

        let snapshot = state.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.node("n1").unwrap().weight(), 1);
        assert_consistent(&snapshot);

        let meta = NodeMeta {
            rpc: vec!["127.0.0.1:1".into()],
            weight: 3,
            ..Default::default()
        };
        state
            .apply(MembershipEvent::NodeUpdated {
                id: "n1".into(),
                meta: meta.clone(),
                client: None,
            })
            .unwrap();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.node("n1").unwrap().meta, meta);
        assert_eq!(snapshot.ring().weights()["n1"], 3);
        assert_eq!(snapshot.pool().addr_of("n1").as_deref(), Some("127.0.0.1:1"));

        state.apply(MembershipEvent::NodeRemoved("n1".into())).unwrap();
        assert!(state.apply(MembershipEvent::NodeRemoved("n1".into())).is_none());
        let snapshot = state.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_consistent(&snapshot);
    }

    #[tokio::test]
    async fn test_update_for_unknown_node_ignored() {
        let state = state();
        let ev = MembershipEvent::NodeUpdated {
            id: "ghost".into(),
            meta: NodeMeta::default(),
            client: None,
        };
        assert!(state.apply(ev).is_none());
        assert!(state.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_readers_see_consistent_snapshots() {
        let state = state();
        let reader = {
            let state = state.clone();
            tokio::spawn(async move {
                for _ in 0..2000 {
                    assert_consistent(&state.snapshot());
                    tokio::task::yield_now().await;
                }
            })
        };
        for round in 0..200 {
            let id = format!("n{}", round % 7);
            if state.snapshot().node(&id).is_some() {
                state.apply(MembershipEvent::NodeRemoved(id));
            } else {
                state.apply(MembershipEvent::NodeAdded(id));
            }
            tokio::task::yield_now().await;
        }
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_held_snapshot_survives_later_events() {
        let cancel = CancellationToken::new();
        let addr = comet(&cancel).await;
        let state = state();
        state.apply(MembershipEvent::NodeAdded("n1".into())).unwrap();
        let first = RpcClient::dial(&addr).await.unwrap();
        state.apply(update("n1", &addr, first.clone())).unwrap();

        let held = state.snapshot();
        let (_, handle) = held.client_for("any-key").unwrap();
        assert!(handle.is_some());

        // an unrelated add keeps the handle alive for both snapshots
        state.apply(MembershipEvent::NodeAdded("n2".into())).unwrap();
        let handle = held.pool().get_by_id("n1").unwrap();
        let _: i32 = handle.call("CometRPC.Ping", &0).await.unwrap();
        let current = state.snapshot().pool().get_by_id("n1").unwrap();
        assert!(current.same_connection(&first));

        // a new leader connection supersedes the old handle
        let second = RpcClient::dial(&addr).await.unwrap();
        state.apply(update("n1", &addr, second.clone())).unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());

        state.apply(MembershipEvent::NodeRemoved("n1".into())).unwrap();
        assert!(second.is_closed());
        cancel.cancel();
    }
}
