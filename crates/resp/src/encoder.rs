//! Replies and outbound framing

use bytes::{BufMut, Bytes, BytesMut};

/// Fixed replies written to subscribe connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Liveness acknowledgement, also sent once right after subscribe
    Heartbeat,
    /// Malformed or invalid client input
    Param,
    /// The key is owned by another node
    Node,
    /// Channel could not be obtained
    Channel,
}

impl Reply {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Reply::Heartbeat => b"+h\r\n",
            Reply::Param => b"-p\r\n",
            Reply::Node => b"-n\r\n",
            Reply::Channel => b"-c\r\n",
        }
    }

    /// Text form used for websocket frames
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Heartbeat => "+h\r\n",
            Reply::Param => "-p\r\n",
            Reply::Node => "-n\r\n",
            Reply::Channel => "-c\r\n",
        }
    }
}

/// Frame a message payload for a TCP subscriber: `$<len>\r\n<payload>\r\n`
pub fn encode_message_frame(payload: &[u8]) -> Bytes {
    let len = payload.len().to_string();
    let mut buf = BytesMut::with_capacity(1 + len.len() + 2 + payload.len() + 2);
    buf.put_u8(b'$');
    buf.put_slice(len.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(payload);
    buf.put_slice(b"\r\n");
    buf.freeze()
}
