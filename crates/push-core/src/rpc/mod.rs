//! Node-to-node RPC transport
//!
//! Length-delimited frames carrying JSON envelopes. A connection multiplexes
//! any number of in-flight calls, matched by sequence number.

pub mod client;
pub mod server;

pub use client::RpcClient;
pub use server::{serve, unknown_method, RpcService};

use crate::error::{PushError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest frame accepted from a peer
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Default per-call timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Call envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    pub method: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Error carried back to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

/// Reply envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub seq: u64,
    #[serde(default)]
    pub error: Option<RemoteError>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Response {
    fn from_result(seq: u64, result: Result<serde_json::Value>) -> Self {
        match result {
            Ok(body) => Self {
                seq,
                error: None,
                body,
            },
            Err(e) => Self {
                seq,
                error: Some(RemoteError {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }),
                body: serde_json::Value::Null,
            },
        }
    }
}

pub(crate) fn framed<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, LengthDelimitedCodec> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec();
    Framed::new(io, codec)
}

/// Decode call arguments, malformed bodies are parameter errors
pub fn decode_args<A: DeserializeOwned>(body: serde_json::Value) -> Result<A> {
    serde_json::from_value(body).map_err(|e| PushError::Parameter(e.to_string()))
}

/// Encode a reply body
pub fn encode_reply<R: Serialize>(reply: &R) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(reply)?)
}
