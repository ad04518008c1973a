//! File persistent storage
//!
//! Persists the persistent part of the path tree to a JSON file

use push_core::coord::PersistedNode;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("File not found: {0}")]
    NotFound(PathBuf),
}

/// File storage
pub struct FileStorage {
    /// Data directory
    data_dir: PathBuf,
    /// Tree file path
    tree_path: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let tree_path = data_dir.join("coord_tree.json");
        Self {
            data_dir,
            tree_path,
        }
    }

    /// Ensure data directory exists
    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir).await?;
            info!("Created data directory: {:?}", self.data_dir);
        }
        Ok(())
    }

    /// Load persisted nodes, `None` on first start
    pub async fn load(&self) -> Result<Option<Vec<PersistedNode>>, StorageError> {
        if !self.tree_path.exists() {
            info!("Tree file not found, starting with an empty tree");
            return Ok(None);
        }

        let content = fs::read_to_string(&self.tree_path).await?;
        let nodes: Vec<PersistedNode> = serde_json::from_str(&content)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        info!("Loaded {} persistent nodes from {:?}", nodes.len(), self.tree_path);
        Ok(Some(nodes))
    }

    pub async fn save(&self, nodes: &[PersistedNode]) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then atomically rename
        let temp_path = self.tree_path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(nodes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.tree_path).await?;

        info!("Saved {} persistent nodes", nodes.len());
        Ok(())
    }

    /// Copy the current tree file aside with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        if !self.tree_path.exists() {
            return Err(StorageError::NotFound(self.tree_path.clone()));
        }

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = self.data_dir.join(format!("coord_tree_{}.json.bak", timestamp));
        fs::copy(&self.tree_path, &backup_path).await?;
        info!("Backed up tree to {:?}", backup_path);
        Ok(backup_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("pilot"));
        assert!(storage.load().await.unwrap().is_none());
        assert!(matches!(storage.backup().await, Err(StorageError::NotFound(_))));

        let nodes = vec![
            PersistedNode {
                path: "/comet".to_string(),
                data: Vec::new(),
            },
            PersistedNode {
                path: "/comet/node1".to_string(),
                data: b"{\"weight\":2}".to_vec(),
            },
        ];
        storage.save(&nodes).await.unwrap();

        let loaded = storage.load().await.unwrap().unwrap();
        assert_eq!(loaded, nodes);
        let backup = storage.backup().await.unwrap();
        assert!(backup.exists());
    }
}
