//! Backend pool watcher
//!
//! Agent and message nodes register `{rpc, weight}` payloads under a root
//! path. Every advertised rpc address becomes one pool member keyed by the
//! address itself.

use super::{sleep_or_cancel, ClusterConfig, EVENT_QUEUE_CAPACITY};
use crate::coord::{join_path, CoordError, CoordStore};
use crate::pool::{PoolMember, WeightedPool};
use crate::rpc::RpcClient;
use crate::types::NodeMeta;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackendEvent {
    Added { addr: String, weight: u32 },
    Removed { addr: String },
}

/// Publishes a [`WeightedPool`] of one backend service
pub struct BackendWatcher {
    service: String,
    config: ClusterConfig,
    store: Arc<dyn CoordStore>,
    current: ArcSwap<WeightedPool>,
}

impl BackendWatcher {
    /// `config.migrate_lock` is not used here
    pub fn new(store: Arc<dyn CoordStore>, service: &str, config: ClusterConfig) -> Arc<Self> {
        Arc::new(Self {
            service: service.to_string(),
            config,
            store,
            current: ArcSwap::from_pointee(WeightedPool::empty(service)),
        })
    }

    /// Currently published pool
    pub fn pool(&self) -> Arc<WeightedPool> {
        self.current.load_full()
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        tokio::spawn(self.clone().watch_root(tx, cancel.clone()));
        tokio::spawn(self.clone().consume(rx, cancel))
    }

    async fn consume(self: Arc<Self>, mut rx: mpsc::Receiver<BackendEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.apply(event).await;
        }
        self.current.load().destroy();
        info!("{} watcher for {} stopped", self.service, self.config.root);
    }

    async fn apply(&self, event: BackendEvent) {
        let old = self.current.load_full();
        match event {
            BackendEvent::Added { addr, weight } => {
                if old.contains(&addr) {
                    return;
                }
                info!("Add {} node {}", self.service, addr);
                let client = match RpcClient::dial(&addr).await {
                    Ok(client) => client,
                    Err(e) => {
                        warn!("Discard {} node {}, dial failed: {}", self.service, addr, e);
                        return;
                    }
                };
                let mut members = old.members();
                members.push(PoolMember::new(&addr, &addr, weight).with_client(client));
                self.reinstall(&old, members);
            }
            BackendEvent::Removed { addr } => {
                if !old.contains(&addr) {
                    return;
                }
                info!("Remove {} node {}", self.service, addr);
                let members = old.members().into_iter().filter(|m| m.id != addr).collect();
                self.reinstall(&old, members);
            }
        }
    }

    /// Publish a pool built from `members`, then retire `old`
    fn reinstall(&self, old: &WeightedPool, members: Vec<PoolMember>) {
        let pool = WeightedPool::new(
            &self.service,
            members,
            self.config.retry,
            self.config.ping,
            true,
        );
        let pool = Arc::new(pool);
        self.current.store(pool.clone());
        old.retire(&pool);
        debug!("{} pool has {} members", self.service, pool.len());
    }

    async fn watch_root(self: Arc<Self>, tx: mpsc::Sender<BackendEvent>, cancel: CancellationToken) {
        let root = self.config.root.clone();
        loop {
            let children = match self.store.children(&root).await {
                Ok(children) => children,
                Err(e) => {
                    if matches!(e, CoordError::NoNode(_)) {
                        warn!("Path {} does not exist, retry in {:?}", root, self.config.wait_delay);
                    } else {
                        error!("Read children of {} failed: {}", root, e);
                    }
                    if !sleep_or_cancel(self.config.wait_delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let pool = self.pool();
            if children.names.is_empty() {
                warn!("Path {} has no children, retry in {:?}", root, self.config.wait_delay);
                for addr in pool.ids() {
                    if tx.send(BackendEvent::Removed { addr }).await.is_err() {
                        return;
                    }
                }
                if !sleep_or_cancel(self.config.wait_delay, &cancel).await {
                    break;
                }
                continue;
            }

            let mut present = HashSet::new();
            for child in &children.names {
                let path = join_path(&root, child);
                let meta = match self.store.get(&path).await {
                    Ok((data, _)) => match NodeMeta::from_slice(&data) {
                        Ok(meta) => meta,
                        Err(e) => {
                            error!("Bad payload under {}: {}", path, e);
                            continue;
                        }
                    },
                    Err(e) => {
                        error!("Read {} failed: {}", path, e);
                        continue;
                    }
                };
                for addr in meta.rpc {
                    if !pool.contains(&addr) {
                        let event = BackendEvent::Added {
                            addr: addr.clone(),
                            weight: meta.weight,
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    present.insert(addr);
                }
            }
            for addr in pool.ids() {
                if !present.contains(&addr) && tx.send(BackendEvent::Removed { addr }).await.is_err() {
                    return;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.store.wait_children(&root, children.version) => {
                    if let Err(e) = res {
                        warn!("Watch {} failed: {}", root, e);
                        if !sleep_or_cancel(self.config.wait_delay, &cancel).await {
                            break;
                        }
                    }
                }
            }
        }
        debug!("{} root watch {} stopped", self.service, root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{create_parents, CreateMode, MemoryStore};
    use crate::error::Result;
    use crate::rpc::{encode_reply, serve, unknown_method, RpcService};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct Backend;

    #[async_trait]
    impl RpcService for Backend {
        async fn call(&self, method: &str, _body: serde_json::Value) -> Result<serde_json::Value> {
            match method {
                "MessageRPC.Ping" => encode_reply(&0),
                other => Err(unknown_method(other)),
            }
        }
    }

    async fn wait_for(watcher: &BackendWatcher, len: usize) {
        for _ in 0..200 {
            if watcher.pool().len() == len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {} members", len);
    }

    #[tokio::test]
    async fn test_pool_follows_registrations() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::new(Backend), cancel.clone()));

        let store = MemoryStore::new();
        create_parents(&store, "/msg").await.unwrap();
        let config = ClusterConfig {
            root: "/msg".to_string(),
            wait_delay: Duration::from_millis(20),
            ..Default::default()
        };
        let watcher = BackendWatcher::new(Arc::new(store.clone()), "MessageRPC", config);
        watcher.start(cancel.clone());

        let registrar = store.new_session();
        let meta = NodeMeta {
            rpc: vec![addr.clone()],
            ..Default::default()
        };
        registrar
            .create("/msg/node", &meta.to_vec().unwrap(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        wait_for(&watcher, 1).await;
        assert!(watcher.pool().get().is_some());
        assert!(watcher.pool().contains(&addr));

        registrar.expire();
        wait_for(&watcher, 0).await;
        assert!(watcher.pool().get().is_none());
        cancel.cancel();
    }
}
