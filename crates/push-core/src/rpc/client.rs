//! Multiplexed RPC client handle

use super::{framed, Request, Response, DEFAULT_CALL_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};
use crate::error::{PushError, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outgoing request queue capacity per connection
const REQUEST_CHANNEL_CAPACITY: usize = 1024;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

struct ClientInner {
    addr: String,
    seq: AtomicU64,
    pending: Pending,
    tx: mpsc::Sender<Request>,
    closed: CancellationToken,
    call_timeout: Duration,
}

/// Cheap-to-clone handle to one remote peer
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("addr", &self.inner.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcClient {
    /// Connect with default timeouts
    pub async fn dial(addr: &str) -> Result<Self> {
        Self::dial_with(addr, DEFAULT_CONNECT_TIMEOUT, DEFAULT_CALL_TIMEOUT).await
    }

    pub async fn dial_with(
        addr: &str,
        connect_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PushError::Rpc(format!("connect {} timed out", addr)))?
            .map_err(|e| PushError::Rpc(format!("connect {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let (mut sink, mut stream) = framed(stream).split();
        let (tx, mut rx) = mpsc::channel::<Request>(REQUEST_CHANNEL_CAPACITY);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        // writer
        let writer_closed = closed.clone();
        let writer_addr = addr.to_string();
        tokio::spawn(async move {
            loop {
                let req = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    req = rx.recv() => match req {
                        Some(req) => req,
                        None => break,
                    },
                };
                let frame = match serde_json::to_vec(&req) {
                    Ok(v) => Bytes::from(v),
                    Err(e) => {
                        warn!("rpc {}: encode request {} failed: {}", writer_addr, req.method, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    warn!("rpc {}: write failed: {}", writer_addr, e);
                    break;
                }
            }
            writer_closed.cancel();
        });

        // reader
        let reader_closed = closed.clone();
        let reader_pending = pending.clone();
        let reader_addr = addr.to_string();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    frame = stream.next() => frame,
                };
                match frame {
                    Some(Ok(buf)) => match serde_json::from_slice::<Response>(&buf) {
                        Ok(resp) => {
                            if let Some(waiter) = reader_pending.lock().remove(&resp.seq) {
                                let _ = waiter.send(resp);
                            }
                        }
                        Err(e) => warn!("rpc {}: bad response frame: {}", reader_addr, e),
                    },
                    Some(Err(e)) => {
                        warn!("rpc {}: read failed: {}", reader_addr, e);
                        break;
                    }
                    None => {
                        debug!("rpc {}: connection closed by peer", reader_addr);
                        break;
                    }
                }
            }
            reader_closed.cancel();
            // dropping the senders fails every outstanding call
            reader_pending.lock().clear();
        });

        Ok(Self {
            inner: Arc::new(ClientInner {
                addr: addr.to_string(),
                seq: AtomicU64::new(1),
                pending,
                tx,
                closed,
                call_timeout,
            }),
        })
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Whether both handles share one connection
    pub fn same_connection(&self, other: &RpcClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Close the connection, outstanding calls fail
    pub fn close(&self) {
        self.inner.closed.cancel();
        self.inner.pending.lock().clear();
    }

    /// Invoke `method` and decode its reply
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(PushError::Rpc(format!("{}: connection closed", self.inner.addr)));
        }
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let req = Request {
            seq,
            method: method.to_string(),
            body: serde_json::to_value(args)?,
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(seq, tx);
        if self.inner.tx.send(req).await.is_err() {
            self.inner.pending.lock().remove(&seq);
            return Err(PushError::Rpc(format!("{}: connection closed", self.inner.addr)));
        }

        let resp = match timeout(self.inner.call_timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                return Err(PushError::Rpc(format!(
                    "{}: connection closed during {}",
                    self.inner.addr, method
                )))
            }
            Err(_) => {
                self.inner.pending.lock().remove(&seq);
                return Err(PushError::Rpc(format!(
                    "{}: {} timed out",
                    self.inner.addr, method
                )));
            }
        };

        if let Some(err) = resp.error {
            return Err(PushError::from_remote(&err.kind, err.message));
        }
        Ok(serde_json::from_value(resp.body)?)
    }
}
