//! Membership watcher driven by the in-memory coordination store

use async_trait::async_trait;
use parking_lot::Mutex;
use push_core::coord::{create_parents, CoordStore, CreateMode, MemoryStore};
use push_core::rpc::{decode_args, encode_reply, serve, unknown_method, RpcService};
use push_core::types::{MigrateArgs, NodeMeta, COMET_MIGRATE};
use push_core::{ClusterConfig, ClusterState, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeComet {
    migrations: Mutex<Vec<HashMap<String, u32>>>,
}

#[async_trait]
impl RpcService for FakeComet {
    async fn call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        match method {
            "CometRPC.Ping" => encode_reply(&0),
            COMET_MIGRATE => {
                let args: MigrateArgs = decode_args(body)?;
                self.migrations.lock().push(args.nodes);
                encode_reply(&0)
            }
            other => Err(unknown_method(other)),
        }
    }
}

async fn start_comet(cancel: &CancellationToken) -> (Arc<FakeComet>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let comet = Arc::new(FakeComet::default());
    tokio::spawn(serve(listener, comet.clone(), cancel.clone()));
    (comet, addr)
}

async fn register(store: &MemoryStore, id: &str, rpc: &str, weight: u32) -> MemoryStore {
    let session = store.new_session();
    let path = format!("/comet/{}", id);
    create_parents(&session, &path).await.unwrap();
    let meta = NodeMeta {
        rpc: vec![rpc.to_string()],
        weight,
        ..Default::default()
    };
    session
        .create(
            &format!("{}/node", path),
            &meta.to_vec().unwrap(),
            CreateMode::EphemeralSequential,
        )
        .await
        .unwrap();
    session
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn config() -> ClusterConfig {
    ClusterConfig {
        root: "/comet".to_string(),
        migrate_lock: "/migrate-lock".to_string(),
        retry: Duration::from_millis(50),
        ping: Duration::from_millis(100),
        wait_delay: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn test_membership_and_migration() {
    let cancel = CancellationToken::new();
    let (comet1, addr1) = start_comet(&cancel).await;
    let (comet2, addr2) = start_comet(&cancel).await;

    let store = MemoryStore::new();
    let state = ClusterState::new(Arc::new(store.clone()), config());
    state.start(cancel.clone());

    let _node1 = register(&store, "n1", &addr1, 2).await;
    eventually("n1 live", || {
        let snapshot = state.snapshot();
        snapshot.node("n1").map(|n| n.weight()) == Some(2)
            && snapshot.pool().get_by_id("n1").is_some()
    })
    .await;

    // Leader update triggers a migration round that writes the payload back
    eventually("first migration", || !comet1.migrations.lock().is_empty()).await;
    assert_eq!(comet1.migrations.lock()[0].get("n1"), Some(&2));
    eventually("write back", || {
        let tree = store.tree();
        tree.get("/comet/n1")
            .map(|(data, _)| !data.is_empty())
            .unwrap_or(false)
    })
    .await;

    let node2 = register(&store, "n2", &addr2, 1).await;
    eventually("n2 live", || {
        let snapshot = state.snapshot();
        snapshot.len() == 2 && snapshot.pool().get_by_id("n2").is_some()
    })
    .await;
    let snapshot = state.snapshot();
    assert_eq!(snapshot.ring().weights().len(), 2);
    for key in ["a", "b", "c", "d"] {
        let owner = snapshot.route(key).unwrap();
        assert!(owner.id == "n1" || owner.id == "n2");
    }

    // Node leaves: registration expires and its directory is removed
    node2.expire();
    store.delete("/comet/n2").await.unwrap();
    eventually("n2 removed", || state.snapshot().node("n2").is_none()).await;
    eventually("removal migration", || {
        comet1
            .migrations
            .lock()
            .iter()
            .any(|nodes| nodes.len() == 1 && nodes.contains_key("n1"))
    })
    .await;
    assert!(!store.exists("/migrate-lock").await.unwrap());
    let _ = comet2;

    cancel.cancel();
}

#[tokio::test]
async fn test_leader_failover_switches_handle() {
    let cancel = CancellationToken::new();
    let (_primary, addr1) = start_comet(&cancel).await;
    let (_standby, addr2) = start_comet(&cancel).await;

    let store = MemoryStore::new();
    let state = ClusterState::new(Arc::new(store.clone()), config());
    state.start(cancel.clone());

    let primary = register(&store, "n1", &addr1, 1).await;
    eventually("primary leads", || {
        state.snapshot().pool().addr_of("n1").as_deref() == Some(addr1.as_str())
    })
    .await;
    let _standby_session = register(&store, "n1", &addr2, 1).await;

    primary.expire();
    eventually("standby leads", || {
        let snapshot = state.snapshot();
        snapshot.pool().addr_of("n1").as_deref() == Some(addr2.as_str())
            && snapshot
                .pool()
                .get_by_id("n1")
                .is_some_and(|c| c.addr() == addr2)
    })
    .await;
    cancel.cancel();
}

#[tokio::test]
async fn test_missing_root_is_retried() {
    let cancel = CancellationToken::new();
    let (_comet, addr) = start_comet(&cancel).await;
    let store = MemoryStore::new();
    let state = ClusterState::new(Arc::new(store.clone()), config());
    state.start(cancel.clone());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(state.snapshot().is_empty());

    let _node = register(&store, "n1", &addr, 1).await;
    eventually("n1 discovered", || state.snapshot().node("n1").is_some()).await;
    cancel.cancel();
}
