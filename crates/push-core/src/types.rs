//! Shared data types and RPC contract
//!
//! Method names are the wire contract between nodes; argument structs are
//! serialized as JSON bodies.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const COMET_SERVICE: &str = "CometRPC";
pub const COMET_PUSH_PRIVATE: &str = "CometRPC.PushPrivate";
pub const COMET_PUSH_PRIVATES: &str = "CometRPC.PushPrivates";
pub const COMET_MIGRATE: &str = "CometRPC.Migrate";

pub const AGENT_SERVICE: &str = "AgentRPC";
pub const AGENT_REPLY_MESSAGE: &str = "AgentRPC.ReplyMessage";

pub const MESSAGE_SERVICE: &str = "MessageRPC";
pub const MESSAGE_SAVE_PRIVATE: &str = "MessageRPC.SavePrivate";
pub const MESSAGE_SAVE_PRIVATES: &str = "MessageRPC.SavePrivates";
pub const MESSAGE_GET_PRIVATE: &str = "MessageRPC.GetPrivate";
pub const MESSAGE_DEL_PRIVATE: &str = "MessageRPC.DelPrivate";
pub const MESSAGE_SAVE_USER_MSG: &str = "MessageRPC.SaveUserMsg";
pub const MESSAGE_GET_USER_MSG: &str = "MessageRPC.GetUserMsg";

/// `<service>.Ping`
pub fn ping_method(service: &str) -> String {
    format!("{}.Ping", service)
}

/// Group id of private (per subscriber) messages
pub const PRIVATE_GROUP_ID: i32 = 0;
/// Group id of public (broadcast) messages
pub const PUBLIC_GROUP_ID: i32 = 1;

/// Content type of plain text replies
pub const TEXT_CONTENT_TYPE: &str = "text";

fn default_weight() -> u32 {
    1
}

/// Registration payload stored under a node path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(default)]
    pub rpc: Vec<String>,
    #[serde(default)]
    pub tcp: Vec<String>,
    #[serde(default)]
    pub ws: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Default for NodeMeta {
    fn default() -> Self {
        Self {
            rpc: Vec::new(),
            tcp: Vec::new(),
            ws: Vec::new(),
            weight: 1,
        }
    }
}

impl NodeMeta {
    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// A message as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message body, opaque JSON
    pub msg: serde_json::Value,
    /// Message id
    pub mid: i64,
    /// Group id
    pub gid: i32,
}

impl Message {
    pub fn private(msg: serde_json::Value) -> Self {
        Self {
            msg,
            mid: 0,
            gid: PRIVATE_GROUP_ID,
        }
    }

    /// Encoding for clients that subscribed with a protocol version
    pub fn versioned_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Encoding for legacy clients: the bare body
    pub fn legacy_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.msg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPrivateArgs {
    pub key: String,
    pub msg: serde_json::Value,
    /// Expire in seconds, 0 means online only
    pub expire: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPrivatesArgs {
    pub keys: Vec<String>,
    pub msg: serde_json::Value,
    pub expire: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushPrivatesReply {
    pub failed_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateArgs {
    /// Current comet nodes and their weights
    pub nodes: HashMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyMessageArgs {
    pub session_id: String,
    #[serde(default)]
    pub msg: Option<serde_json::Value>,
    pub new_session: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavePrivateArgs {
    pub key: String,
    pub msg: serde_json::Value,
    pub mid: i64,
    pub expire: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavePrivatesArgs {
    pub keys: Vec<String>,
    pub msg: serde_json::Value,
    pub mid: i64,
    pub expire: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPrivateArgs {
    pub key: String,
    /// Only messages newer than this id are returned
    pub mid: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelPrivateArgs {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveUserMsgArgs {
    pub session_id: String,
    pub msg: serde_json::Value,
    pub mid: i64,
    pub expire: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUserMsgArgs {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagesReply {
    pub msgs: Vec<Message>,
    #[serde(default)]
    pub content_type: String,
}
