//! Per-key channel
//!
//! A channel holds every live connection of one subscriber key and fans
//! messages out to them. Adding a connection first writes the heartbeat
//! acknowledgement to its socket; only then is it attached and its writer
//! started.

use crate::config::ChannelConfig;
use crate::connection::{ConnId, Connection, SharedTransport};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use push_core::types::{Message, SavePrivateArgs, MESSAGE_SAVE_PRIVATE, PUBLIC_GROUP_ID};
use push_core::{next_id, BackendWatcher, PushError, Result};
use resp::Reply;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Persists private messages before they are fanned out
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn save_private(&self, args: &SavePrivateArgs) -> Result<()>;
}

#[async_trait]
impl MessageSink for BackendWatcher {
    async fn save_private(&self, args: &SavePrivateArgs) -> Result<()> {
        let client = self
            .pool()
            .get()
            .ok_or_else(|| PushError::Rpc("no message node available".to_string()))?;
        client
            .call::<_, serde_json::Value>(MESSAGE_SAVE_PRIVATE, args)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
struct ChannelState {
    conns: HashMap<ConnId, Connection>,
    next_id: ConnId,
    /// Subscribers between admission and attach
    pending: usize,
    closed: bool,
}

/// Fan-out unit of one subscriber key
pub struct Channel {
    key: String,
    max_conns: usize,
    msgbuf: usize,
    sink: Arc<dyn MessageSink>,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub fn new(key: &str, config: &ChannelConfig, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            key: key.to_string(),
            max_conns: config.max_subscribers,
            msgbuf: config.msgbuf,
            sink,
            state: Mutex::new(ChannelState::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.state.lock().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Add a subscriber; the heartbeat reply is written before it is attached
    pub async fn add_conn(
        &self,
        transport: SharedTransport,
        version: &str,
        cancel: CancellationToken,
    ) -> Result<ConnId> {
        if !self.reserve()? {
            return Err(PushError::Routing(format!("channel {} closed", self.key)));
        }
        self.attach(transport, version, cancel).await
    }

    /// Admit one subscriber; `false` when the channel is already closed
    pub(crate) fn reserve(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(false);
        }
        if state.conns.len() + state.pending >= self.max_conns {
            warn!(
                "channel {} exceeds max subscribers {}",
                self.key, self.max_conns
            );
            return Err(PushError::Capacity(self.max_conns));
        }
        state.pending += 1;
        Ok(true)
    }

    /// Finish a [`Channel::reserve`]d subscribe
    pub(crate) async fn attach(
        &self,
        transport: SharedTransport,
        version: &str,
        cancel: CancellationToken,
    ) -> Result<ConnId> {
        let written = {
            let mut t = transport.lock().await;
            t.send_reply(Reply::Heartbeat).await.map(|_| t.kind())
        };

        let mut state = self.state.lock();
        state.pending -= 1;
        let kind = written?;
        if state.closed {
            return Err(PushError::Routing(format!("channel {} closed", self.key)));
        }
        let id = state.next_id;
        state.next_id += 1;
        let conn = Connection::start(transport, kind, version.to_string(), self.msgbuf, cancel);
        state.conns.insert(id, conn);
        debug!(
            "channel {} added {:?} conn {} ({} total)",
            self.key,
            kind,
            id,
            state.conns.len()
        );
        Ok(id)
    }

    /// Detach a connection, returning how many remain
    pub fn remove_conn(&self, id: ConnId) -> usize {
        let mut state = self.state.lock();
        if state.conns.remove(&id).is_some() {
            debug!("channel {} removed conn {}", self.key, id);
        }
        state.conns.len()
    }

    /// Close the channel if nobody is attached or attaching
    pub(crate) fn retire_if_empty(&self) -> bool {
        let mut state = self.state.lock();
        if state.conns.is_empty() && state.pending == 0 {
            state.closed = true;
            true
        } else {
            false
        }
    }

    /// Queue `msg` on every connection, returning how many accepted it
    ///
    /// Legacy and versioned encodings are each built at most once.
    pub fn write_msg(&self, msg: &Message) -> Result<usize> {
        let state = self.state.lock();
        let mut legacy = None;
        let mut versioned = None;
        let mut sent = 0;
        for conn in state.conns.values() {
            let payload = if conn.is_legacy() {
                encoded(&mut legacy, || msg.legacy_bytes())?
            } else {
                encoded(&mut versioned, || msg.versioned_bytes())?
            };
            if conn.offer(payload) {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Assign an id, persist private messages with an expiry, then fan out
    pub async fn push_msg(&self, msg: serde_json::Value, gid: i32, expire: u64) -> Result<i64> {
        let mid = store_msg(self.sink.as_ref(), &self.key, &msg, gid, expire).await?;
        let sent = self.write_msg(&Message { msg, mid, gid })?;
        debug!("channel {} pushed message {} to {} conns", self.key, mid, sent);
        Ok(mid)
    }

    /// Close every connection; later subscribes are refused
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let closed = state.conns.len();
        for (_, conn) in state.conns.drain() {
            conn.close();
        }
        closed
    }
}

/// Assign a message id, saving private messages that expire
pub(crate) async fn store_msg(
    sink: &dyn MessageSink,
    key: &str,
    msg: &serde_json::Value,
    gid: i32,
    expire: u64,
) -> Result<i64> {
    let mid = next_id();
    if gid != PUBLIC_GROUP_ID && expire > 0 {
        let args = SavePrivateArgs {
            key: key.to_string(),
            msg: msg.clone(),
            mid,
            expire,
        };
        sink.save_private(&args).await?;
    }
    Ok(mid)
}

fn encoded<F>(slot: &mut Option<Bytes>, encode: F) -> Result<Bytes>
where
    F: FnOnce() -> serde_json::Result<Vec<u8>>,
{
    if let Some(payload) = slot {
        return Ok(payload.clone());
    }
    let payload = Bytes::from(encode()?);
    *slot = Some(payload.clone());
    Ok(payload)
}
