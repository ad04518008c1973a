//! RPC accept loop and dispatch

use super::{framed, Request, Response};
use crate::error::{PushError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Service invoked for every decoded request
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handle one call; unknown methods should return a parameter error
    async fn call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value>;
}

/// Error for methods a service does not implement
pub fn unknown_method(method: &str) -> PushError {
    PushError::Parameter(format!("unknown method {}", method))
}

/// Serve `service` on `listener` until `cancel` fires
pub async fn serve<S: RpcService>(
    listener: TcpListener,
    service: Arc<S>,
    cancel: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!("rpc server listening on {}", local);

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!("rpc server {} stopped", local);
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!("rpc {} accepted {}", local, peer);
                let service = service.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    handle_conn(stream, service, cancel).await;
                    debug!("rpc {} closed {}", local, peer);
                });
            }
            Err(e) => error!("rpc {} accept failed: {}", local, e),
        }
    }
}

async fn handle_conn<S: RpcService>(stream: TcpStream, service: Arc<S>, cancel: CancellationToken) {
    let _ = stream.set_nodelay(true);
    let (mut sink, mut frames) = framed(stream).split();
    let (tx, mut rx) = mpsc::channel::<Response>(1024);

    let writer = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            let frame = match serde_json::to_vec(&resp) {
                Ok(v) => Bytes::from(v),
                Err(e) => {
                    error!("encode response {} failed: {}", resp.seq, e);
                    continue;
                }
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        let buf = match frame {
            Some(Ok(buf)) => buf,
            Some(Err(e)) => {
                warn!("rpc read failed: {}", e);
                break;
            }
            None => break,
        };
        let req: Request = match serde_json::from_slice(&buf) {
            Ok(req) => req,
            Err(e) => {
                warn!("rpc bad request frame: {}", e);
                break;
            }
        };
        let service = service.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = service.call(&req.method, req.body).await;
            if let Err(e) = &result {
                debug!("rpc {} failed: {}", req.method, e);
            }
            let _ = tx.send(Response::from_result(req.seq, result)).await;
        });
    }

    drop(tx);
    let _ = writer.await;
}
