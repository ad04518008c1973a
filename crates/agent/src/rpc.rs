//! `AgentRPC` service

use crate::robot;
use async_trait::async_trait;
use push_core::rpc::{decode_args, encode_reply, unknown_method, RpcClient, RpcService};
use push_core::types::{
    ping_method, GetUserMsgArgs, MessagesReply, PushPrivateArgs, ReplyMessageArgs,
    SaveUserMsgArgs, AGENT_REPLY_MESSAGE, AGENT_SERVICE, COMET_PUSH_PRIVATE,
    MESSAGE_GET_USER_MSG, MESSAGE_SAVE_USER_MSG,
};
use push_core::{next_id, BackendWatcher, ClusterState, PushError, Result};
use std::sync::Arc;
use tracing::{debug, error};

/// Answers subscriber messages through the comet that holds the session
pub struct AgentRpc {
    comets: Arc<ClusterState>,
    messages: Arc<BackendWatcher>,
    user_msg_expire: u64,
    ping: String,
}

impl AgentRpc {
    pub fn new(comets: Arc<ClusterState>, messages: Arc<BackendWatcher>, user_msg_expire: u64) -> Self {
        Self {
            comets,
            messages,
            user_msg_expire,
            ping: ping_method(AGENT_SERVICE),
        }
    }

    /// Build the reply for a session and push it to the owning comet
    pub async fn reply_message(&self, args: ReplyMessageArgs) -> Result<()> {
        if args.session_id.is_empty() {
            return Err(PushError::Parameter("empty session id".to_string()));
        }

        let snapshot = self.comets.snapshot();
        let comet = match snapshot.client_for(&args.session_id) {
            Some((_, Some(client))) => client,
            Some((node, None)) => {
                return Err(PushError::Routing(format!(
                    "comet node {} has no rpc handle",
                    node.id
                )))
            }
            None => {
                return Err(PushError::Routing(format!(
                    "no comet node for session {}",
                    args.session_id
                )))
            }
        };
        debug!("received from session {}: {:?}", args.session_id, args.msg);

        let reply = if args.new_session {
            robot::welcome()
        } else {
            self.record(&args).await?
        };

        let push = PushPrivateArgs {
            key: args.session_id.clone(),
            msg: serde_json::to_value(&reply)?,
            expire: 0,
        };
        if let Err(e) = comet.call::<_, serde_json::Value>(COMET_PUSH_PRIVATE, &push).await {
            error!("{} to session {} failed: {}", COMET_PUSH_PRIVATE, push.key, e);
            return Err(PushError::Rpc(format!("push reply failed: {}", e)));
        }
        debug!("replied to session {}", push.key);
        Ok(())
    }

    /// Store the user message, then read back the conversation
    async fn record(&self, args: &ReplyMessageArgs) -> Result<MessagesReply> {
        let Some(msg) = args.msg.clone() else {
            return Err(PushError::Parameter("empty message".to_string()));
        };
        let client = self.message_client()?;

        let save = SaveUserMsgArgs {
            session_id: args.session_id.clone(),
            msg,
            mid: next_id(),
            expire: self.user_msg_expire,
        };
        client
            .call::<_, serde_json::Value>(MESSAGE_SAVE_USER_MSG, &save)
            .await
            .inspect_err(|e| error!("{} for {} failed: {}", MESSAGE_SAVE_USER_MSG, save.session_id, e))?;

        let get = GetUserMsgArgs {
            session_id: args.session_id.clone(),
        };
        let reply: MessagesReply = client
            .call(MESSAGE_GET_USER_MSG, &get)
            .await
            .inspect_err(|e| error!("{} for {} failed: {}", MESSAGE_GET_USER_MSG, get.session_id, e))?;
        Ok(reply)
    }

    fn message_client(&self) -> Result<RpcClient> {
        self.messages
            .pool()
            .get()
            .ok_or_else(|| PushError::Rpc("no message node available".to_string()))
    }
}

#[async_trait]
impl RpcService for AgentRpc {
    async fn call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        match method {
            AGENT_REPLY_MESSAGE => {
                self.reply_message(decode_args(body)?).await?;
                encode_reply(&0)
            }
            m if m == self.ping => {
                debug!("ping ok");
                encode_reply(&0)
            }
            other => Err(unknown_method(other)),
        }
    }
}
