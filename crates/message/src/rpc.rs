//! `MessageRPC` service

use crate::storage::Storage;
use async_trait::async_trait;
use push_core::rpc::{decode_args, encode_reply, unknown_method, RpcService};
use push_core::types::{
    ping_method, DelPrivateArgs, GetPrivateArgs, GetUserMsgArgs, MessagesReply, SavePrivateArgs,
    SavePrivatesArgs, SaveUserMsgArgs, MESSAGE_DEL_PRIVATE, MESSAGE_GET_PRIVATE,
    MESSAGE_GET_USER_MSG, MESSAGE_SAVE_PRIVATE, MESSAGE_SAVE_PRIVATES, MESSAGE_SAVE_USER_MSG,
    MESSAGE_SERVICE,
};
use push_core::{PushError, Result};
use std::sync::Arc;
use tracing::{debug, error};

pub struct MessageRpc {
    storage: Arc<dyn Storage>,
    ping: String,
}

fn check_body(msg: &serde_json::Value, mid: i64) -> Result<()> {
    if msg.is_null() {
        return Err(PushError::Parameter("missing message body".to_string()));
    }
    if mid < 0 {
        return Err(PushError::Parameter(format!("negative message id {}", mid)));
    }
    Ok(())
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(PushError::Parameter("empty key".to_string()));
    }
    Ok(())
}

impl MessageRpc {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            ping: ping_method(MESSAGE_SERVICE),
        }
    }

    async fn save_private(&self, args: SavePrivateArgs) -> Result<()> {
        check_key(&args.key)?;
        check_body(&args.msg, args.mid)?;
        self.storage
            .save_private(&args.key, args.msg, args.mid, args.expire)
            .await
            .inspect_err(|e| error!("save private {} mid {} failed: {}", args.key, args.mid, e))?;
        debug!("saved private {} mid {}", args.key, args.mid);
        Ok(())
    }

    async fn save_privates(&self, args: SavePrivatesArgs) -> Result<()> {
        check_body(&args.msg, args.mid)?;
        if args.keys.is_empty() {
            return Err(PushError::Parameter("empty keys".to_string()));
        }
        self.storage
            .save_privates(&args.keys, args.msg, args.mid, args.expire)
            .await
            .inspect_err(|e| error!("save privates {:?} mid {} failed: {}", args.keys, args.mid, e))
    }

    async fn get_private(&self, args: GetPrivateArgs) -> Result<MessagesReply> {
        check_key(&args.key)?;
        if args.mid < 0 {
            return Err(PushError::Parameter(format!("negative message id {}", args.mid)));
        }
        let msgs = self.storage.get_private(&args.key, args.mid).await?;
        debug!("get private {} after {}: {} messages", args.key, args.mid, msgs.len());
        Ok(MessagesReply {
            msgs,
            content_type: String::new(),
        })
    }

    async fn del_private(&self, args: DelPrivateArgs) -> Result<()> {
        check_key(&args.key)?;
        self.storage.del_private(&args.key).await
    }

    async fn save_user_msg(&self, args: SaveUserMsgArgs) -> Result<()> {
        check_key(&args.session_id)?;
        check_body(&args.msg, args.mid)?;
        self.storage
            .save_user_msg(&args.session_id, args.msg, args.mid, args.expire)
            .await
    }

    async fn get_user_msg(&self, args: GetUserMsgArgs) -> Result<MessagesReply> {
        check_key(&args.session_id)?;
        let msgs = self.storage.get_user_msg(&args.session_id).await?;
        Ok(MessagesReply {
            msgs,
            content_type: String::new(),
        })
    }
}

#[async_trait]
impl RpcService for MessageRpc {
    async fn call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        match method {
            MESSAGE_SAVE_PRIVATE => {
                self.save_private(decode_args(body)?).await?;
                encode_reply(&0)
            }
            MESSAGE_SAVE_PRIVATES => {
                self.save_privates(decode_args(body)?).await?;
                encode_reply(&0)
            }
            MESSAGE_GET_PRIVATE => encode_reply(&self.get_private(decode_args(body)?).await?),
            MESSAGE_DEL_PRIVATE => {
                self.del_private(decode_args(body)?).await?;
                encode_reply(&0)
            }
            MESSAGE_SAVE_USER_MSG => {
                self.save_user_msg(decode_args(body)?).await?;
                encode_reply(&0)
            }
            MESSAGE_GET_USER_MSG => encode_reply(&self.get_user_msg(decode_args(body)?).await?),
            m if m == self.ping => encode_reply(&0),
            other => Err(unknown_method(other)),
        }
    }
}
