//! Agent node
//!
//! Answers messages that websocket subscribers send through their comet
//! node, and keeps the comet cluster consistent: it watches comet
//! membership and broadcasts `Migrate` rounds when nodes leave or change.
//!
//! # Usage Example
//! ```ignore
//! use agent::{Agent, Config};
//!
//! let agent = Agent::new(Config::default(), store);
//! let meta = agent.start(cancel.clone()).await?;
//! ```

pub mod config;
pub mod robot;
pub mod rpc;

pub use config::{Config, ConfigError};
pub use rpc::AgentRpc;

use push_core::coord::CoordStore;
use push_core::types::{NodeMeta, MESSAGE_SERVICE};
use push_core::{advertised, register_backend, BackendWatcher, ClusterState, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// An agent node and the clusters it watches
pub struct Agent {
    config: Config,
    store: Arc<dyn CoordStore>,
    comets: Arc<ClusterState>,
    messages: Arc<BackendWatcher>,
}

impl Agent {
    pub fn new(config: Config, store: Arc<dyn CoordStore>) -> Self {
        let comets = ClusterState::new(store.clone(), config.comet_cluster());
        let messages = BackendWatcher::new(store.clone(), MESSAGE_SERVICE, config.message_cluster());
        Self {
            config,
            store,
            comets,
            messages,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn comets(&self) -> &Arc<ClusterState> {
        &self.comets
    }

    pub fn messages(&self) -> &Arc<BackendWatcher> {
        &self.messages
    }

    /// Start the watchers, serve `AgentRPC` and register the node
    pub async fn start(&self, cancel: CancellationToken) -> Result<NodeMeta> {
        self.comets.start(cancel.clone());
        self.messages.start(cancel.clone());

        let service = Arc::new(AgentRpc::new(
            self.comets.clone(),
            self.messages.clone(),
            self.config.session.user_msg_expire,
        ));
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
            &self.config.coord.agent_path,
            &self.config.node.name,
            &meta,
        )
        .await?;
        info!("Agent {} started as {}", self.config.node.name, path);
        Ok(meta)
    }
}
