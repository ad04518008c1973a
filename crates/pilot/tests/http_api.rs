//! The pilot HTTP API driven through the coordination store client

use std::sync::Arc;
use std::time::Duration;

use pilot::{api::HttpApi, Pilot, PilotConfig};
use push_core::coord::{create_parents, CoordError, CoordStore, CreateMode};
use push_core::{PilotStore, PilotStoreConfig};

async fn start_pilot(dir: &tempfile::TempDir) -> String {
    let config = PilotConfig {
        data_dir: dir.path().to_path_buf(),
        watch_max_wait_ms: 200,
        ..Default::default()
    };
    let pilot = Arc::new(Pilot::new(config).await.unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = HttpApi::new(pilot).router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn connect(pilot_addr: &str) -> PilotStore {
    PilotStore::connect(PilotStoreConfig {
        pilot_addr: pilot_addr.to_string(),
        session_ttl_secs: 3,
        request_timeout_secs: 2,
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_tree_operations() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_pilot(&dir).await;
    let store = connect(&addr).await;

    create_parents(&store, "/comet/n1").await.unwrap();
    assert!(store.exists("/comet/n1").await.unwrap());
    assert!(!store.exists("/missing").await.unwrap());

    let path = store
        .create("/comet/n1/node", b"{\"weight\":1}", CreateMode::EphemeralSequential)
        .await
        .unwrap();
    assert_eq!(path, "/comet/n1/node0000000000");
    let children = store.children("/comet/n1").await.unwrap();
    assert_eq!(children.names, vec!["node0000000000"]);

    let version = store.set("/comet/n1", b"meta").await.unwrap();
    let (data, data_version) = store.get("/comet/n1").await.unwrap();
    assert_eq!(data, b"meta");
    assert_eq!(data_version, version);

    assert!(matches!(
        store.create("/comet", b"", CreateMode::Persistent).await,
        Err(CoordError::NodeExists(_))
    ));
    assert!(matches!(
        store.delete("/comet").await,
        Err(CoordError::NotEmpty(_))
    ));
    assert!(matches!(
        store.get("/nope").await,
        Err(CoordError::NoNode(_))
    ));

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_watch_and_session_close() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_pilot(&dir).await;
    let observer = connect(&addr).await;
    let member = connect(&addr).await;

    create_parents(&observer, "/agents").await.unwrap();
    let before = observer.children("/agents").await.unwrap();

    let waiter = {
        let observer = observer.clone();
        tokio::spawn(async move { observer.wait_children("/agents", before.version).await })
    };
    // Longer than the server side max wait, the client keeps polling
    tokio::time::sleep(Duration::from_millis(300)).await;
    member
        .create("/agents/a", b"{}", CreateMode::EphemeralSequential)
        .await
        .unwrap();
    let changed = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_ne!(changed, before.version);

    member.close().await.unwrap();
    assert!(observer.children("/agents").await.unwrap().names.is_empty());
    observer.close().await.unwrap();
}
