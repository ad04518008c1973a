//! Message node
//!
//! Stores private messages for offline subscribers and the conversation
//! history agents read back, served as `MessageRPC`.
//!
//! # Usage Example
//! ```ignore
//! use message::{Config, MessageNode};
//!
//! let node = MessageNode::new(Config::default(), store);
//! let meta = node.start(cancel.clone()).await?;
//! ```

pub mod config;
pub mod rpc;
pub mod storage;

pub use config::{Config, ConfigError};
pub use rpc::MessageRpc;
pub use storage::{MemoryStorage, Storage};

use push_core::coord::CoordStore;
use push_core::types::NodeMeta;
use push_core::{advertised, register_backend, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct MessageNode {
    config: Config,
    store: Arc<dyn CoordStore>,
    storage: Arc<MemoryStorage>,
}

impl MessageNode {
    pub fn new(config: Config, store: Arc<dyn CoordStore>) -> Self {
        let storage = MemoryStorage::new(&config.storage);
        Self {
            config,
            store,
            storage,
        }
    }

    pub fn storage(&self) -> &Arc<MemoryStorage> {
        &self.storage
    }

    /// Start the cleaner, serve `MessageRPC` and register the node
    pub async fn start(&self, cancel: CancellationToken) -> Result<NodeMeta> {
        self.storage.start(cancel.clone());

        let service = Arc::new(MessageRpc::new(self.storage.clone()));
        let mut meta = self.config.node_meta();
        meta.rpc.clear();
        for bind in &self.config.network.rpc_bind {
            let listener = TcpListener::bind(bind).await?;
            meta.rpc.push(advertised(bind, listener.local_addr()?));
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = push_core::rpc::serve(listener, service, cancel).await {
                    error!("rpc server failed: {}", e);
                }
            });
        }

        let path = register_backend(
            self.store.as_ref(),
            &self.config.coord.message_path,
            &self.config.node.name,
            &meta,
        )
        .await?;
        info!("Message node {} started as {}", self.config.node.name, path);
        Ok(meta)
    }
}
