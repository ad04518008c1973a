//! Comet node
//!
//! Holds long-lived subscriber connections and fans pushed messages out to
//! them.
//!
//! # Features
//! - Per-key channels spread over crc32 buckets, reclaimed when empty
//! - TCP (`*<argc>` command protocol) and WebSocket subscribers
//! - Bounded per-connection outbound queues; a stalled subscriber loses
//!   messages instead of blocking the fan-out
//! - `CometRPC` push and migrate service
//! - Self registration in the coordination store
//!
//! # Usage Example
//! ```ignore
//! use comet::{Comet, Config};
//!
//! let comet = Comet::new(Config::default(), store);
//! let meta = comet.start(cancel.clone()).await?;
//! ```

pub mod bucket;
pub mod channel;
pub mod config;
pub mod connection;
pub mod rpc;
pub mod tcp;
pub mod ws;

pub use bucket::ChannelList;
pub use channel::{Channel, MessageSink};
pub use config::{Config, ConfigError};
pub use connection::{ConnId, TransportKind};
pub use rpc::CometRpc;

use push_core::coord::CoordStore;
use push_core::types::{NodeMeta, AGENT_SERVICE, MESSAGE_SERVICE};
use push_core::{advertised, register_node, BackendWatcher, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A comet node and the backends it talks to
pub struct Comet {
    config: Config,
    store: Arc<dyn CoordStore>,
    channels: Arc<ChannelList>,
    agents: Arc<BackendWatcher>,
    messages: Arc<BackendWatcher>,
}

impl Comet {
    pub fn new(config: Config, store: Arc<dyn CoordStore>) -> Self {
        let messages = BackendWatcher::new(
            store.clone(),
            MESSAGE_SERVICE,
            config.backend_cluster(&config.coord.message_path),
        );
        let agents = BackendWatcher::new(
            store.clone(),
            AGENT_SERVICE,
            config.backend_cluster(&config.coord.agent_path),
        );
        let channels = Arc::new(ChannelList::new(
            &config.node.name,
            config.channel.clone(),
            messages.clone(),
        ));
        Self {
            config,
            store,
            channels,
            agents,
            messages,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channels(&self) -> &Arc<ChannelList> {
        &self.channels
    }

    pub fn agents(&self) -> &Arc<BackendWatcher> {
        &self.agents
    }

    pub fn messages(&self) -> &Arc<BackendWatcher> {
        &self.messages
    }

    /// Bind every listener, start serving and register the node
    ///
    /// Returns the registered payload; binds with port 0 advertise the port
    /// actually chosen.
    pub async fn start(&self, cancel: CancellationToken) -> Result<NodeMeta> {
        self.messages.start(cancel.clone());
        self.agents.start(cancel.clone());

        let mut meta = self.config.node_meta();

        let service = Arc::new(CometRpc::new(self.channels.clone()));
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

        meta.tcp.clear();
        for bind in &self.config.network.tcp_bind {
            let listener = TcpListener::bind(bind).await?;
            meta.tcp.push(advertised(bind, listener.local_addr()?));
            let server = tcp::TcpServer::new(self.channels.clone(), self.config.network.tcp_keepalive);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(listener, cancel).await {
                    error!("TCP subscribe server failed: {}", e);
                }
            });
        }

        meta.ws.clear();
        let state = ws::WsState::new(self.channels.clone(), self.agents.clone(), cancel.clone());
        for bind in &self.config.network.ws_bind {
            let listener = TcpListener::bind(bind).await?;
            let local = listener.local_addr()?;
            meta.ws.push(advertised(bind, local));
            let app = ws::router(state.clone());
            let cancel = cancel.clone();
            tokio::spawn(async move {
                info!("Websocket subscribe server listening on {}", local);
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(cancel.cancelled_owned())
                    .await
                {
                    error!("Websocket subscribe server failed: {}", e);
                }
            });
        }

        let path = register_node(
            self.store.as_ref(),
            &self.config.coord.comet_path,
            &self.config.node.name,
            &meta,
        )
        .await?;
        info!("Comet {} started as {}", self.config.node.name, path);
        Ok(meta)
    }

    /// Close every subscriber connection
    pub fn shutdown(&self) -> usize {
        self.channels.close()
    }
}
