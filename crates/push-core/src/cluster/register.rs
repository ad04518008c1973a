//! Self registration in the coordination store
//!
//! Comet nodes register as `<root>/<node>/node<seq>` so several processes
//! may compete for one node id (the smallest child leads). Backend nodes
//! register directly under their root as `<root>/<node><seq>`.

use crate::coord::{create_parents, join_path, CoordError, CoordResult, CoordStore, CreateMode};
use crate::types::NodeMeta;
use std::net::SocketAddr;
use tracing::info;

/// Address to publish for a listener bound at `bind`
///
/// Port 0 binds publish the port the listener actually got.
pub fn advertised(bind: &str, local: SocketAddr) -> String {
    if bind.ends_with(":0") {
        local.to_string()
    } else {
        bind.to_string()
    }
}

/// Register a comet node, returning the created ephemeral path
pub async fn register_node(
    store: &dyn CoordStore,
    root: &str,
    node: &str,
    meta: &NodeMeta,
) -> CoordResult<String> {
    let node_path = join_path(root, node);
    create_parents(store, &node_path).await?;
    let data = meta
        .to_vec()
        .map_err(|e| CoordError::Transport(e.to_string()))?;
    let path = store
        .create(&join_path(&node_path, "node"), &data, CreateMode::EphemeralSequential)
        .await?;
    info!("Registered {} under {}", node, path);
    Ok(path)
}

/// Register an agent or message node, returning the created ephemeral path
pub async fn register_backend(
    store: &dyn CoordStore,
    root: &str,
    node: &str,
    meta: &NodeMeta,
) -> CoordResult<String> {
    create_parents(store, root).await?;
    let data = meta
        .to_vec()
        .map_err(|e| CoordError::Transport(e.to_string()))?;
    let path = store
        .create(&join_path(root, node), &data, CreateMode::EphemeralSequential)
        .await?;
    info!("Registered {} under {}", node, path);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryStore;

    fn meta(rpc: &str) -> NodeMeta {
        NodeMeta {
            rpc: vec![rpc.to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_advertised() {
        let local: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        assert_eq!(advertised("127.0.0.1:0", local), "127.0.0.1:40001");
        assert_eq!(advertised("localhost:6969", local), "localhost:6969");
    }

    #[tokio::test]
    async fn test_register_node_competes_under_node_path() {
        let store = MemoryStore::new();
        let other = store.new_session();
        let first = register_node(&store, "/comet", "n1", &meta("a:1")).await.unwrap();
        let second = register_node(&other, "/comet", "n1", &meta("b:1")).await.unwrap();
        assert_eq!(first, "/comet/n1/node0000000000");
        assert_eq!(second, "/comet/n1/node0000000001");

        other.expire();
        assert_eq!(
            store.children("/comet/n1").await.unwrap().names,
            vec!["node0000000000"]
        );
    }

    #[tokio::test]
    async fn test_register_backend_is_ephemeral() {
        let store = MemoryStore::new();
        let session = store.new_session();
        let path = register_backend(&session, "/msg", "node1", &meta("m:1")).await.unwrap();
        assert_eq!(path, "/msg/node10000000000");
        let (data, _) = store.get(&path).await.unwrap();
        assert_eq!(NodeMeta::from_slice(&data).unwrap().rpc, vec!["m:1"]);

        session.expire();
        assert!(store.children("/msg").await.unwrap().names.is_empty());
    }
}
