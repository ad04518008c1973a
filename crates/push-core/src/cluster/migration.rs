//! Migration coordinator
//!
//! After a node is removed or updated, every live comet node is told the new
//! weights so it can drop the channels it no longer owns. An ephemeral lock
//! node keeps the round cluster wide exclusive.

use super::ClusterSnapshot;
use crate::coord::{join_path, CoordError, CoordStore, CreateMode};
use crate::error::Result;
use crate::types::{MigrateArgs, COMET_MIGRATE};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Result of one migration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Another coordinator holds the lock, nothing was sent
    Skipped,
    /// Round ran; `notified` of `total` nodes acknowledged `Migrate`
    Completed { notified: usize, total: usize },
}

pub struct MigrationCoordinator {
    store: Arc<dyn CoordStore>,
    root: String,
    lock_path: String,
}

impl MigrationCoordinator {
    pub fn new(store: Arc<dyn CoordStore>, root: &str, lock_path: &str) -> Self {
        Self {
            store,
            root: root.to_string(),
            lock_path: lock_path.to_string(),
        }
    }

    pub fn lock_path(&self) -> &str {
        &self.lock_path
    }

    /// Run one round for a change of `node_id`
    ///
    /// With `update` set, the node's current payload is written back under
    /// its path once the broadcast is done. The lock is released on every
    /// path out of a started round.
    pub async fn notify(
        &self,
        snapshot: &ClusterSnapshot,
        node_id: &str,
        update: bool,
    ) -> Result<MigrationOutcome> {
        match self
            .store
            .create(&self.lock_path, b"1", CreateMode::Ephemeral)
            .await
        {
            Ok(_) => {}
            Err(CoordError::NodeExists(_)) => {
                info!("Migration lock {} is held, skip", self.lock_path);
                return Ok(MigrationOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        }

        let result = self.run_round(snapshot, node_id, update).await;

        if let Err(e) = self.store.delete(&self.lock_path).await {
            error!("Failed to release migration lock {}: {}", self.lock_path, e);
        }
        result
    }

    async fn run_round(
        &self,
        snapshot: &ClusterSnapshot,
        node_id: &str,
        update: bool,
    ) -> Result<MigrationOutcome> {
        let args = MigrateArgs {
            nodes: snapshot.weights(),
        };
        let total = snapshot.len();

        let calls = snapshot.nodes().keys().map(|id| {
            let client = snapshot.pool().get_by_id(id);
            let args = &args;
            async move {
                let Some(client) = client else {
                    error!("Notify migrate failed, no rpc handle for node {}", id);
                    return false;
                };
                match client
                    .call::<_, serde_json::Value>(COMET_MIGRATE, args)
                    .await
                {
                    Ok(_) => {
                        debug!("Notified node {} to migrate", id);
                        true
                    }
                    Err(e) => {
                        error!("{} to node {} failed: {}", COMET_MIGRATE, id, e);
                        false
                    }
                }
            }
        });
        let notified = join_all(calls).await.into_iter().filter(|ok| *ok).count();
        info!("Migration for node {}: notified {}/{}", node_id, notified, total);

        if update {
            if let Some(node) = snapshot.node(node_id) {
                let path = join_path(&self.root, node_id);
                self.store.set(&path, &node.meta.to_vec()?).await?;
            }
        }
        Ok(MigrationOutcome::Completed { notified, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeInfo;
    use crate::coord::{create_parents, MemoryStore};
    use crate::pool::{PoolMember, WeightedPool};
    use crate::ring::Ring;
    use crate::rpc::{decode_args, encode_reply, serve, unknown_method, RpcClient, RpcService};
    use crate::types::COMET_SERVICE;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    struct GatedComet {
        calls: AtomicUsize,
        gate: Semaphore,
    }

    #[async_trait]
    impl RpcService for GatedComet {
        async fn call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value> {
            match method {
                COMET_MIGRATE => {
                    let _args: MigrateArgs = decode_args(body)?;
                    self.calls.fetch_add(1, Ordering::SeqCst);
                    let permit = self.gate.acquire().await;
                    drop(permit);
                    encode_reply(&0)
                }
                other => Err(unknown_method(other)),
            }
        }
    }

    async fn setup() -> (Arc<GatedComet>, Arc<ClusterSnapshot>, CancellationToken) {
        let comet = Arc::new(GatedComet {
            calls: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, comet.clone(), cancel.clone()));

        let client = RpcClient::dial(&addr).await.unwrap();
        let mut nodes = HashMap::new();
        nodes.insert("n1".to_string(), NodeInfo::new("n1"));
        nodes.insert("n2".to_string(), NodeInfo::new("n2"));
        let weights: HashMap<String, u32> = nodes.keys().map(|k| (k.clone(), 1)).collect();
        let pool = WeightedPool::new(
            COMET_SERVICE,
            vec![
                PoolMember::new("n1", &addr, 1).with_client(client),
                PoolMember::new("n2", "", 1),
            ],
            Duration::from_secs(1),
            Duration::from_secs(1),
            false,
        );
        let snapshot = Arc::new(ClusterSnapshot::new(nodes, Ring::from_weights(&weights), pool));
        (comet, snapshot, cancel)
    }

    #[tokio::test]
    async fn test_concurrent_rounds_are_exclusive() {
        let (comet, snapshot, cancel) = setup().await;
        let store = MemoryStore::new();
        let first = Arc::new(MigrationCoordinator::new(
            Arc::new(store.clone()),
            "/comet",
            "/lock",
        ));
        let second = MigrationCoordinator::new(Arc::new(store.new_session()), "/comet", "/lock");

        let running = {
            let first = first.clone();
            let snapshot = snapshot.clone();
            tokio::spawn(async move { first.notify(&snapshot, "n2", false).await })
        };
        while comet.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let outcome = second.notify(&snapshot, "n2", false).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Skipped);
        assert_eq!(comet.calls.load(Ordering::SeqCst), 1);

        comet.gate.add_permits(1);
        let outcome = running.await.unwrap().unwrap();
        // n2 has no handle
        assert_eq!(outcome, MigrationOutcome::Completed { notified: 1, total: 2 });
        assert!(!store.exists("/lock").await.unwrap());

        comet.gate.add_permits(1);
        let outcome = second.notify(&snapshot, "n2", false).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Completed { notified: 1, total: 2 });
        assert_eq!(comet.calls.load(Ordering::SeqCst), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_update_writes_back_and_releases_lock() {
        let (comet, snapshot, cancel) = setup().await;
        comet.gate.add_permits(10);
        let store = MemoryStore::new();
        let coordinator = MigrationCoordinator::new(Arc::new(store.clone()), "/comet", "/lock");

        // Node path missing: the write-back fails but the lock is still released
        assert!(coordinator.notify(&snapshot, "n1", true).await.is_err());
        assert!(!store.exists("/lock").await.unwrap());

        create_parents(&store, "/comet/n1").await.unwrap();
        coordinator.notify(&snapshot, "n1", true).await.unwrap();
        let (data, _) = store.get("/comet/n1").await.unwrap();
        let meta = crate::types::NodeMeta::from_slice(&data).unwrap();
        assert_eq!(meta, snapshot.node("n1").unwrap().meta);
        cancel.cancel();
    }
}
