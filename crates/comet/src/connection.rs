//! Subscriber connections
//!
//! A [`Connection`] is the channel side of one subscriber socket: a bounded
//! outbound queue drained by a dedicated writer task. The socket's read loop
//! and the writer share the write side through [`SharedTransport`].

use async_trait::async_trait;
use bytes::Bytes;
use resp::{encode_message_frame, Reply};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stable identity of a connection inside its channel
pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    WebSocket,
}

/// Write side of a subscriber socket
#[async_trait]
pub trait Transport: Send + 'static {
    fn kind(&self) -> TransportKind;

    /// Write one of the fixed replies
    async fn send_reply(&mut self, reply: Reply) -> io::Result<()>;

    /// Write one encoded message
    async fn send_message(&mut self, payload: &[u8]) -> io::Result<()>;
}

pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

pub fn shared(transport: impl Transport) -> SharedTransport {
    Arc::new(Mutex::new(Box::new(transport)))
}

/// Write a fixed reply, logging failures
pub(crate) async fn reply(transport: &SharedTransport, reply: Reply) {
    if let Err(e) = transport.lock().await.send_reply(reply).await {
        debug!("Reply {:?} failed: {}", reply, e);
    }
}

/// TCP write half: replies raw, messages framed as `$<len>\r\n<payload>\r\n`
pub struct TcpTransport<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send + 'static> TcpTransport<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> Transport for TcpTransport<W> {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn send_reply(&mut self, reply: Reply) -> io::Result<()> {
        self.writer.write_all(reply.as_bytes()).await?;
        self.writer.flush().await
    }

    async fn send_message(&mut self, payload: &[u8]) -> io::Result<()> {
        self.writer.write_all(&encode_message_frame(payload)).await?;
        self.writer.flush().await
    }
}

/// Channel side of a subscriber
pub struct Connection {
    kind: TransportKind,
    version: String,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl Connection {
    /// Start the writer task for `transport` and return the channel side
    ///
    /// The writer stops when the connection is dropped or `cancel` fires.
    pub(crate) fn start(
        transport: SharedTransport,
        kind: TransportKind,
        version: String,
        msgbuf: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(msgbuf.max(1));
        tokio::spawn(write_loop(transport, rx, cancel.clone()));
        Self {
            kind,
            version,
            tx,
            cancel,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Protocol version, empty for legacy clients
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_legacy(&self) -> bool {
        self.version.is_empty()
    }

    /// Queue a payload without waiting; a full queue drops it
    pub(crate) fn offer(&self, payload: Bytes) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("{:?} subscriber queue full, message dropped", self.kind);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("{:?} subscriber writer already stopped", self.kind);
                false
            }
        }
    }

    /// Stop the writer and the socket's read loop
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }
}

async fn write_loop(
    transport: SharedTransport,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = async { transport.lock().await.send_message(&payload).await } => written,
        };
        if let Err(e) = written {
            warn!("write to subscriber failed: {}", e);
            break;
        }
    }
}
