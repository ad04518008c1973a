//! Pilot - Coordination service
//!
//! Keeps the hierarchical path tree the push cluster registers in.
//!
//! # Features
//! - Persistent, ephemeral and sequential nodes
//! - Sessions with ttl; ephemeral nodes vanish with their session
//! - Version based long-poll watches on child lists and data
//! - Periodic file persistence of persistent nodes
//!
//! # Usage Example
//! ```ignore
//! use pilot::{Pilot, PilotConfig};
//!
//! let pilot = Arc::new(Pilot::new(PilotConfig::default()).await?);
//! let app = pilot::api::HttpApi::new(pilot.clone()).router();
//! ```

pub mod api;
pub mod config;
pub mod session;
pub mod storage;

pub use config::{ConfigError, PilotConfig};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use push_core::coord::Tree;
use session::SessionManager;
use storage::{FileStorage, StorageError};

/// Pilot coordination service
pub struct Pilot {
    config: PilotConfig,
    storage: FileStorage,
    tree: Arc<Tree>,
    sessions: Arc<SessionManager>,
}

impl Pilot {
    /// Create a pilot, restoring persistent nodes from the data directory
    pub async fn new(config: PilotConfig) -> Result<Self, StorageError> {
        let storage = FileStorage::new(&config.data_dir);
        let tree = Arc::new(Tree::new());
        if let Some(nodes) = storage.load().await? {
            let loaded = tree
                .restore(nodes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            info!("Restored {} persistent nodes", loaded);
        }
        let sessions = Arc::new(SessionManager::new(config.session.clone(), tree.clone()));

        info!(
            "Pilot initialized: data_dir={:?}, http_addr={}",
            config.data_dir, config.http_addr
        );

        Ok(Self {
            config,
            storage,
            tree,
            sessions,
        })
    }

    pub fn config(&self) -> &PilotConfig {
        &self.config
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Longest time a watch request is held open
    pub fn watch_max_wait(&self) -> Duration {
        Duration::from_millis(self.config.watch_max_wait_ms)
    }

    /// Save persistent nodes
    pub async fn save(&self) -> Result<(), StorageError> {
        let nodes = self.tree.persistent_nodes();
        self.storage.save(&nodes).await
    }

    /// Start session expiry checker
    pub fn start_session_checker(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.sessions.clone().start_checker(cancel)
    }

    /// Start periodic save task
    pub fn start_periodic_save(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(self.config.save_interval_secs);
        tokio::spawn(async move {
            let mut interval = interval(period);
            // First tick fires immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = self.save().await {
                    error!("Failed to save tree: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use push_core::coord::CreateMode;

    #[tokio::test]
    async fn test_restart_keeps_persistent_nodes_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = PilotConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let pilot = Pilot::new(config.clone()).await.unwrap();
        let session = pilot.sessions().open(0).session_id;
        pilot
            .tree()
            .create("/comet", b"", CreateMode::Persistent, 0)
            .unwrap();
        pilot
            .tree()
            .create("/comet/n1", b"meta", CreateMode::Persistent, 0)
            .unwrap();
        pilot
            .tree()
            .create("/comet/n1/node", b"{}", CreateMode::EphemeralSequential, session)
            .unwrap();
        pilot.save().await.unwrap();

        let restarted = Pilot::new(config).await.unwrap();
        let (data, _) = restarted.tree().get("/comet/n1").unwrap();
        assert_eq!(data, b"meta");
        assert!(restarted.tree().children("/comet/n1").unwrap().names.is_empty());
    }
}
