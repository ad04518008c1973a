//! In-memory coordination tree
//!
//! Every mutation bumps a global transaction counter (`zxid`). A node's data
//! version is the zxid of its last data change and its child version the
//! zxid of its last child list change; a missing node reports version 0.
//! Waiters compare against these versions, so a deleted and recreated node
//! is still observed as a change.

use super::{parent_path, Children, CoordError, CoordResult, CreateMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Which version a waiter follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Children,
    Data,
}

/// Persistent node as written to disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedNode {
    pub path: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct ZNode {
    data: Vec<u8>,
    data_version: u64,
    child_version: u64,
    children: BTreeSet<String>,
    owner: Option<u64>,
    sequence: u64,
}

impl ZNode {
    fn new(data: Vec<u8>, zxid: u64, owner: Option<u64>) -> Self {
        Self {
            data,
            data_version: zxid,
            child_version: zxid,
            children: BTreeSet::new(),
            owner,
            sequence: 0,
        }
    }
}

struct TreeState {
    nodes: HashMap<String, ZNode>,
    zxid: u64,
    next_session: u64,
    ephemerals: HashMap<u64, BTreeSet<String>>,
}

/// Coordination tree shared by every session
pub struct Tree {
    state: Mutex<TreeState>,
    watches: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(path: &str) -> CoordResult<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(CoordError::InvalidPath(path.to_string()));
    }
    Ok(())
}

impl Tree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), ZNode::new(Vec::new(), 0, None));
        Self {
            state: Mutex::new(TreeState {
                nodes,
                zxid: 0,
                next_session: 1,
                ephemerals: HashMap::new(),
            }),
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a session id for ephemeral ownership
    pub fn new_session(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_session;
        state.next_session += 1;
        id
    }

    pub fn children(&self, path: &str) -> CoordResult<Children> {
        validate(path)?;
        let state = self.state.lock();
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        Ok(Children {
            names: node.children.iter().cloned().collect(),
            version: node.child_version,
        })
    }

    pub fn get(&self, path: &str) -> CoordResult<(Vec<u8>, u64)> {
        validate(path)?;
        let state = self.state.lock();
        state
            .nodes
            .get(path)
            .map(|n| (n.data.clone(), n.data_version))
            .ok_or_else(|| CoordError::NoNode(path.to_string()))
    }

    pub fn exists(&self, path: &str) -> CoordResult<bool> {
        validate(path)?;
        Ok(self.state.lock().nodes.contains_key(path))
    }

    pub fn set(&self, path: &str, data: &[u8]) -> CoordResult<u64> {
        validate(path)?;
        let version = {
            let mut state = self.state.lock();
            state.zxid += 1;
            let zxid = state.zxid;
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
            node.data = data.to_vec();
            node.data_version = zxid;
            zxid
        };
        self.fire(path);
        Ok(version)
    }

    /// Create a node owned by `session` when `mode` is ephemeral
    pub fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        session: u64,
    ) -> CoordResult<String> {
        validate(path)?;
        let parent = parent_path(path).ok_or_else(|| CoordError::NodeExists(path.to_string()))?;
        let actual = {
            let mut state = self.state.lock();
            let parent_node = state
                .nodes
                .get_mut(parent)
                .ok_or_else(|| CoordError::NoNode(parent.to_string()))?;
            if parent_node.owner.is_some() {
                return Err(CoordError::EphemeralParent(parent.to_string()));
            }
            let actual = if mode == CreateMode::EphemeralSequential {
                let seq = parent_node.sequence;
                parent_node.sequence += 1;
                format!("{}{:010}", path, seq)
            } else {
                path.to_string()
            };
            if state.nodes.contains_key(&actual) {
                return Err(CoordError::NodeExists(actual));
            }

            state.zxid += 1;
            let zxid = state.zxid;
            let name = actual[parent.len()..].trim_start_matches('/').to_string();
            if let Some(parent_node) = state.nodes.get_mut(parent) {
                parent_node.children.insert(name);
                parent_node.child_version = zxid;
            }
            let owner = mode.is_ephemeral().then_some(session);
            state
                .nodes
                .insert(actual.clone(), ZNode::new(data.to_vec(), zxid, owner));
            if let Some(owner) = owner {
                state.ephemerals.entry(owner).or_default().insert(actual.clone());
            }
            actual
        };
        debug!("coord create {} ({:?})", actual, mode);
        self.fire(&actual);
        self.fire(parent);
        Ok(actual)
    }

    pub fn delete(&self, path: &str) -> CoordResult<()> {
        validate(path)?;
        let parent = parent_path(path).ok_or_else(|| CoordError::InvalidPath(path.to_string()))?;
        {
            let mut state = self.state.lock();
            let node = state
                .nodes
                .get(path)
                .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
            if !node.children.is_empty() {
                return Err(CoordError::NotEmpty(path.to_string()));
            }
            let owner = node.owner;
            state.nodes.remove(path);
            state.zxid += 1;
            let zxid = state.zxid;
            if let Some(parent_node) = state.nodes.get_mut(parent) {
                let name = path[parent.len()..].trim_start_matches('/');
                parent_node.children.remove(name);
                parent_node.child_version = zxid;
            }
            if let Some(owner) = owner {
                if let Some(set) = state.ephemerals.get_mut(&owner) {
                    set.remove(path);
                }
            }
        }
        debug!("coord delete {}", path);
        self.fire(path);
        self.fire(parent);
        Ok(())
    }

    /// Remove every ephemeral node owned by `session`
    pub fn close_session(&self, session: u64) -> usize {
        let paths = self
            .state
            .lock()
            .ephemerals
            .remove(&session)
            .unwrap_or_default();
        let mut removed = 0;
        for path in paths {
            if self.delete(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("coord session {} closed, {} ephemeral nodes removed", session, removed);
        }
        removed
    }

    /// Current version of `path`, 0 when missing
    pub fn version(&self, path: &str, kind: WatchKind) -> u64 {
        let state = self.state.lock();
        state
            .nodes
            .get(path)
            .map(|n| match kind {
                WatchKind::Children => n.child_version,
                WatchKind::Data => n.data_version,
            })
            .unwrap_or(0)
    }

    /// Wait until the version of `path` differs from `version`
    ///
    /// Returns the new version, or the unchanged one when `max_wait` elapses.
    pub async fn wait(
        &self,
        path: &str,
        kind: WatchKind,
        version: u64,
        max_wait: Option<Duration>,
    ) -> u64 {
        let deadline = max_wait.map(|d| Instant::now() + d);
        loop {
            let notify = self.watch_handle(path);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.version(path, kind);
            if current != version {
                return current;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.version(path, kind);
                    }
                }
                None => notified.await,
            }
        }
    }

    fn watch_handle(&self, path: &str) -> Arc<Notify> {
        self.watches
            .lock()
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn fire(&self, path: &str) {
        if let Some(notify) = self.watches.lock().remove(path) {
            notify.notify_waiters();
        }
    }

    /// Persistent nodes, parents before children
    pub fn persistent_nodes(&self) -> Vec<PersistedNode> {
        let state = self.state.lock();
        let mut nodes: Vec<PersistedNode> = state
            .nodes
            .iter()
            .filter(|(path, n)| n.owner.is_none() && path.as_str() != "/")
            .map(|(path, n)| PersistedNode {
                path: path.clone(),
                data: n.data.clone(),
            })
            .collect();
        nodes.sort_by(|a, b| {
            let da = a.path.matches('/').count();
            let db = b.path.matches('/').count();
            da.cmp(&db).then_with(|| a.path.cmp(&b.path))
        });
        nodes
    }

    /// Load persistent nodes saved by [`Tree::persistent_nodes`]
    pub fn restore(&self, nodes: Vec<PersistedNode>) -> CoordResult<usize> {
        let mut loaded = 0;
        for node in nodes {
            match self.create(&node.path, &node.data, CreateMode::Persistent, 0) {
                Ok(_) => loaded += 1,
                Err(CoordError::NodeExists(_)) => {
                    self.set(&node.path, &node.data)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(loaded)
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_get_set_delete() {
        let tree = Tree::new();
        tree.create("/a", b"1", CreateMode::Persistent, 0).unwrap();
        let (data, v1) = tree.get("/a").unwrap();
        assert_eq!(data, b"1");
        let v2 = tree.set("/a", b"2").unwrap();
        assert!(v2 > v1);
        assert_eq!(tree.get("/a").unwrap().0, b"2");
        tree.delete("/a").unwrap();
        assert_eq!(tree.get("/a"), Err(CoordError::NoNode("/a".to_string())));
    }

    #[test]
    fn test_create_errors() {
        let tree = Tree::new();
        assert!(matches!(
            tree.create("/a/b", b"", CreateMode::Persistent, 0),
            Err(CoordError::NoNode(_))
        ));
        tree.create("/a", b"", CreateMode::Persistent, 0).unwrap();
        assert!(matches!(
            tree.create("/a", b"", CreateMode::Persistent, 0),
            Err(CoordError::NodeExists(_))
        ));
        assert!(matches!(
            tree.create("a", b"", CreateMode::Persistent, 0),
            Err(CoordError::InvalidPath(_))
        ));
        tree.create("/a/b", b"", CreateMode::Persistent, 0).unwrap();
        assert!(matches!(tree.delete("/a"), Err(CoordError::NotEmpty(_))));
    }

    #[test]
    fn test_sequential_names_sort() {
        let tree = Tree::new();
        tree.create("/comet", b"", CreateMode::Persistent, 0).unwrap();
        let s = tree.new_session();
        let p1 = tree
            .create("/comet/n", b"", CreateMode::EphemeralSequential, s)
            .unwrap();
        let p2 = tree
            .create("/comet/n", b"", CreateMode::EphemeralSequential, s)
            .unwrap();
        assert_eq!(p1, "/comet/n0000000000");
        assert_eq!(p2, "/comet/n0000000001");
        assert_eq!(
            tree.children("/comet").unwrap().names,
            vec!["n0000000000", "n0000000001"]
        );
    }

    #[test]
    fn test_close_session_removes_ephemerals() {
        let tree = Tree::new();
        tree.create("/root", b"", CreateMode::Persistent, 0).unwrap();
        let s1 = tree.new_session();
        let s2 = tree.new_session();
        tree.create("/root/a", b"", CreateMode::Ephemeral, s1).unwrap();
        tree.create("/root/b", b"", CreateMode::Ephemeral, s2).unwrap();
        assert!(matches!(
            tree.create("/root/a/x", b"", CreateMode::Persistent, 0),
            Err(CoordError::EphemeralParent(_))
        ));
        assert_eq!(tree.close_session(s1), 1);
        assert_eq!(tree.children("/root").unwrap().names, vec!["b"]);
    }

    #[test]
    fn test_persistent_snapshot_skips_ephemerals() {
        let tree = Tree::new();
        tree.create("/a", b"x", CreateMode::Persistent, 0).unwrap();
        tree.create("/a/b", b"y", CreateMode::Persistent, 0).unwrap();
        let s = tree.new_session();
        tree.create("/a/e", b"", CreateMode::Ephemeral, s).unwrap();
        let nodes = tree.persistent_nodes();
        assert_eq!(
            nodes.iter().map(|n| n.path.as_str()).collect::<Vec<_>>(),
            vec!["/a", "/a/b"]
        );

        let restored = Tree::new();
        assert_eq!(restored.restore(nodes).unwrap(), 2);
        assert_eq!(restored.get("/a/b").unwrap().0, b"y");
    }

    #[tokio::test]
    async fn test_wait_children_wakes_on_change() {
        let tree = Arc::new(Tree::new());
        tree.create("/w", b"", CreateMode::Persistent, 0).unwrap();
        let version = tree.children("/w").unwrap().version;

        let waiter = {
            let tree = tree.clone();
            tokio::spawn(async move { tree.wait("/w", WatchKind::Children, version, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tree.create("/w/c", b"", CreateMode::Persistent, 0).unwrap();
        let new_version = waiter.await.unwrap();
        assert_ne!(new_version, version);
        assert_eq!(new_version, tree.children("/w").unwrap().version);
    }

    #[tokio::test]
    async fn test_wait_times_out_unchanged() {
        let tree = Tree::new();
        tree.create("/w", b"", CreateMode::Persistent, 0).unwrap();
        let version = tree.version("/w", WatchKind::Data);
        let got = tree
            .wait("/w", WatchKind::Data, version, Some(Duration::from_millis(30)))
            .await;
        assert_eq!(got, version);
    }

    #[tokio::test]
    async fn test_wait_sees_deletion() {
        let tree = Arc::new(Tree::new());
        tree.create("/gone", b"", CreateMode::Persistent, 0).unwrap();
        let version = tree.version("/gone", WatchKind::Data);
        let waiter = {
            let tree = tree.clone();
            tokio::spawn(async move { tree.wait("/gone", WatchKind::Data, version, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tree.delete("/gone").unwrap();
        assert_eq!(waiter.await.unwrap(), 0);
    }
}
