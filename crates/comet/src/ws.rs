//! WebSocket subscribe server
//!
//! `GET /sub?key=&heartbeat=&ver=` upgrades to a websocket subscriber. The
//! text frame `h` is a heartbeat; any other text is a client message handed
//! to an agent node.

use crate::bucket::ChannelList;
use crate::connection::{reply, shared, Transport, TransportKind};
use crate::tcp::failure_reply;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use push_core::types::{ReplyMessageArgs, AGENT_REPLY_MESSAGE};
use push_core::BackendWatcher;
use resp::{Reply, Subscribe, HEARTBEAT_DELAY_SECS};
use serde::Deserialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Text frame carrying a heartbeat
const HEARTBEAT_TEXT: &str = "h";

struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl Transport for WsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send_reply(&mut self, reply: Reply) -> io::Result<()> {
        self.sink
            .send(Message::Text(reply.as_str().to_string()))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    async fn send_message(&mut self, payload: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(payload).into_owned();
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Subscribe query parameters
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubQuery {
    pub key: String,
    pub heartbeat: String,
    pub ver: String,
}

/// Shared state of the websocket server
pub struct WsState {
    channels: Arc<ChannelList>,
    agents: Arc<BackendWatcher>,
    cancel: CancellationToken,
}

impl WsState {
    pub fn new(
        channels: Arc<ChannelList>,
        agents: Arc<BackendWatcher>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            channels,
            agents,
            cancel,
        })
    }

    /// Hand a client message (or the start of a session) to an agent node
    async fn reply_message(&self, key: &str, msg: Option<serde_json::Value>, new_session: bool) {
        let Some(client) = self.agents.pool().get() else {
            warn!("No agent node available for {}", key);
            return;
        };
        let args = ReplyMessageArgs {
            session_id: key.to_string(),
            msg,
            new_session,
        };
        if let Err(e) = client
            .call::<_, serde_json::Value>(AGENT_REPLY_MESSAGE, &args)
            .await
        {
            warn!("ReplyMessage for {} failed: {}", key, e);
        }
    }
}

/// Websocket routes
pub fn router(state: Arc<WsState>) -> Router {
    Router::new()
        .route("/sub", get(sub_handler))
        .with_state(state)
}

async fn sub_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<SubQuery>,
    State(state): State<Arc<WsState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

async fn handle_socket(socket: WebSocket, query: SubQuery, state: Arc<WsState>) {
    let (sink, mut stream) = socket.split();
    let transport = shared(WsTransport { sink });

    let sub = match Subscribe::new(&query.key, &query.heartbeat, &query.ver) {
        Ok(sub) => sub,
        Err(e) => {
            warn!("Bad websocket subscribe: {}", e);
            reply(&transport, Reply::Param).await;
            return;
        }
    };

    let cancel = state.cancel.child_token();
    let (channel, id) = match state
        .channels
        .subscribe(&sub.key, transport.clone(), &sub.version, cancel.clone())
        .await
    {
        Ok(added) => added,
        Err(e) => {
            warn!("Subscribe {} failed: {}", sub.key, e);
            if let Some(r) = failure_reply(&e) {
                reply(&transport, r).await;
            }
            return;
        }
    };
    info!("Websocket subscriber {} joined (heartbeat {}s)", sub.key, sub.heartbeat);
    state.reply_message(&sub.key, None, true).await;

    let deadline = Duration::from_secs(sub.heartbeat + HEARTBEAT_DELAY_SECS);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(deadline, stream.next()) => next,
        };
        match next {
            Ok(Some(Ok(Message::Text(text)))) => {
                if text == HEARTBEAT_TEXT {
                    if let Err(e) = transport.lock().await.send_reply(Reply::Heartbeat).await {
                        warn!("Heartbeat reply to {} failed: {}", sub.key, e);
                        break;
                    }
                    debug!("Heartbeat from {}", sub.key);
                    continue;
                }
                let msg = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(_) => serde_json::Value::String(text),
                };
                state.reply_message(&sub.key, Some(msg), false).await;
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                debug!("Websocket {} read failed: {}", sub.key, e);
                break;
            }
            Err(_) => {
                info!("Subscriber {} missed heartbeat for {:?}", sub.key, deadline);
                break;
            }
        }
    }

    state.channels.remove_conn(&channel, id);
    info!("Websocket subscriber {} left", sub.key);
}
