//! In-process coordination store

use super::{Children, CoordResult, CoordStore, CreateMode, Tree, WatchKind};
use async_trait::async_trait;
use std::sync::Arc;

/// A session on a shared in-memory [`Tree`]
///
/// Every handle owns one session; ephemeral nodes it creates disappear when
/// [`MemoryStore::expire`] is called. Cloning shares the session,
/// [`MemoryStore::new_session`] opens a new one on the same tree.
#[derive(Clone)]
pub struct MemoryStore {
    tree: Arc<Tree>,
    session: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Fresh tree with one session
    pub fn new() -> Self {
        Self::with_tree(Arc::new(Tree::new()))
    }

    pub fn with_tree(tree: Arc<Tree>) -> Self {
        let session = tree.new_session();
        Self { tree, session }
    }

    /// Another session on the same tree, as if from a different process
    pub fn new_session(&self) -> Self {
        Self::with_tree(self.tree.clone())
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// End this session, dropping its ephemeral nodes
    pub fn expire(&self) -> usize {
        self.tree.close_session(self.session)
    }
}

#[async_trait]
impl CoordStore for MemoryStore {
    async fn children(&self, path: &str) -> CoordResult<Children> {
        self.tree.children(path)
    }

    async fn wait_children(&self, path: &str, version: u64) -> CoordResult<u64> {
        Ok(self.tree.wait(path, WatchKind::Children, version, None).await)
    }

    async fn get(&self, path: &str) -> CoordResult<(Vec<u8>, u64)> {
        self.tree.get(path)
    }

    async fn wait_data(&self, path: &str, version: u64) -> CoordResult<u64> {
        Ok(self.tree.wait(path, WatchKind::Data, version, None).await)
    }

    async fn set(&self, path: &str, data: &[u8]) -> CoordResult<u64> {
        self.tree.set(path, data)
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        self.tree.create(path, data, mode, self.session)
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        self.tree.delete(path)
    }

    async fn exists(&self, path: &str) -> CoordResult<bool> {
        self.tree.exists(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::CoordError;

    #[tokio::test]
    async fn test_ephemeral_lock_exclusive_across_sessions() {
        let a = MemoryStore::new();
        let b = a.new_session();
        a.create("/lock", b"1", CreateMode::Ephemeral).await.unwrap();
        assert!(matches!(
            b.create("/lock", b"1", CreateMode::Ephemeral).await,
            Err(CoordError::NodeExists(_))
        ));
        a.expire();
        b.create("/lock", b"1", CreateMode::Ephemeral).await.unwrap();
    }
}
