//! `CometRPC` service

use crate::bucket::ChannelList;
use async_trait::async_trait;
use push_core::rpc::{decode_args, encode_reply, unknown_method, RpcService};
use push_core::types::{
    ping_method, MigrateArgs, PushPrivateArgs, PushPrivatesArgs, PushPrivatesReply,
    COMET_MIGRATE, COMET_PUSH_PRIVATE, COMET_PUSH_PRIVATES, COMET_SERVICE, PRIVATE_GROUP_ID,
};
use push_core::{PushError, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Pushes into local channels on behalf of agent and web nodes
pub struct CometRpc {
    channels: Arc<ChannelList>,
    ping: String,
}

impl CometRpc {
    pub fn new(channels: Arc<ChannelList>) -> Self {
        Self {
            channels,
            ping: ping_method(COMET_SERVICE),
        }
    }

    async fn push_private(&self, args: PushPrivateArgs) -> Result<i64> {
        if args.key.is_empty() {
            return Err(PushError::Parameter("empty key".to_string()));
        }
        self.channels
            .push_msg(&args.key, args.msg, PRIVATE_GROUP_ID, args.expire)
            .await
    }

    async fn push_privates(&self, args: PushPrivatesArgs) -> Result<PushPrivatesReply> {
        if args.keys.is_empty() {
            return Err(PushError::Parameter("empty keys".to_string()));
        }
        let mut reply = PushPrivatesReply::default();
        for key in args.keys {
            let pushed = self
                .push_private(PushPrivateArgs {
                    key: key.clone(),
                    msg: args.msg.clone(),
                    expire: args.expire,
                })
                .await;
            if let Err(e) = pushed {
                warn!("push to {} failed: {}", key, e);
                reply.failed_keys.push(key);
            }
        }
        Ok(reply)
    }

    fn migrate(&self, args: MigrateArgs) -> Result<usize> {
        if args.nodes.is_empty() {
            return Err(PushError::Parameter("empty node weights".to_string()));
        }
        info!("migrate request: {:?}", args.nodes);
        Ok(self.channels.migrate(&args.nodes))
    }
}

#[async_trait]
impl RpcService for CometRpc {
    async fn call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        match method {
            COMET_PUSH_PRIVATE => {
                let mid = self.push_private(decode_args(body)?).await?;
                encode_reply(&mid)
            }
            COMET_PUSH_PRIVATES => encode_reply(&self.push_privates(decode_args(body)?).await?),
            COMET_MIGRATE => encode_reply(&self.migrate(decode_args(body)?)?),
            m if m == self.ping => encode_reply(&0),
            other => Err(unknown_method(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::RecordingSink;
    use crate::config::ChannelConfig;
    use serde_json::json;

    fn service(node: &str) -> (Arc<ChannelList>, Arc<RecordingSink>, CometRpc) {
        let config = ChannelConfig {
            max_subscribers: 4,
            msgbuf: 8,
            bucket_count: 2,
        };
        let sink = Arc::new(RecordingSink::default());
        let channels = Arc::new(ChannelList::new(node, config, sink.clone()));
        (channels.clone(), sink, CometRpc::new(channels))
    }

    #[tokio::test]
    async fn test_push_to_offline_keys_creates_no_channels() {
        let (channels, sink, rpc) = service("11");
        for i in 0..1000 {
            let mid = rpc
                .call(
                    COMET_PUSH_PRIVATE,
                    json!({"key": format!("offline-{}", i), "msg": {"t": i}, "expire": 60}),
                )
                .await
                .unwrap();
            assert!(mid.as_i64().unwrap() > 0);
        }
        assert!(channels.is_empty());
        assert_eq!(sink.saved.lock().len(), 1000);

        rpc.call(COMET_PUSH_PRIVATE, json!({"key": "k1", "msg": 1, "expire": 0}))
            .await
            .unwrap();
        assert!(channels.get("k1", false).is_err());
        assert_eq!(sink.saved.lock().len(), 1000);
    }

    #[tokio::test]
    async fn test_parameter_errors() {
        let (_, _, rpc) = service("11");
        let err = rpc
            .call(COMET_PUSH_PRIVATE, json!({"key": "", "msg": 1, "expire": 0}))
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::Parameter(_)));
        let err = rpc.call(COMET_PUSH_PRIVATE, json!({"msg": 1})).await.unwrap_err();
        assert!(matches!(err, PushError::Parameter(_)));
        let err = rpc.call(COMET_MIGRATE, json!({"nodes": {}})).await.unwrap_err();
        assert!(matches!(err, PushError::Parameter(_)));
        let err = rpc.call("CometRPC.Nope", json!(null)).await.unwrap_err();
        assert!(matches!(err, PushError::Parameter(_)));
    }

    #[tokio::test]
    async fn test_migrate_then_push_privates_reports_foreign_keys() {
        let (_, _, rpc) = service("11");
        let moved = rpc
            .call(COMET_MIGRATE, json!({"nodes": {"11": 1, "22": 1}}))
            .await
            .unwrap();
        assert_eq!(moved, json!(0));

        let reply = rpc
            .call(
                COMET_PUSH_PRIVATES,
                json!({"keys": ["lucas-chi332", "lucas-chi333"], "msg": "hi", "expire": 0}),
            )
            .await
            .unwrap();
        let reply: PushPrivatesReply = serde_json::from_value(reply).unwrap();
        assert_eq!(reply.failed_keys, vec!["lucas-chi332"]);
    }

    #[tokio::test]
    async fn test_ping() {
        let (_, _, rpc) = service("11");
        assert_eq!(rpc.call("CometRPC.Ping", json!(null)).await.unwrap(), json!(0));
    }
}
