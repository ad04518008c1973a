//! Channel buckets
//!
//! Channels are spread over a fixed number of buckets by crc32 of the key,
//! each bucket behind its own lock, so lookups for different keys rarely
//! contend. A local ring decides which keys this node may serve.

use crate::channel::{store_msg, Channel, MessageSink};
use crate::config::ChannelConfig;
use crate::connection::{ConnId, SharedTransport};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use push_core::{PushError, Result, Ring};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Retries when a fetched channel is reclaimed before the subscriber lands
const SUBSCRIBE_ATTEMPTS: usize = 3;

type Bucket = Mutex<HashMap<String, Arc<Channel>>>;

/// All channels of this node
pub struct ChannelList {
    node: String,
    config: ChannelConfig,
    sink: Arc<dyn MessageSink>,
    ring: ArcSwap<Ring>,
    buckets: Vec<Bucket>,
}

impl ChannelList {
    pub fn new(node: &str, config: ChannelConfig, sink: Arc<dyn MessageSink>) -> Self {
        let buckets = (0..config.bucket_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            node: node.to_string(),
            config,
            sink,
            ring: ArcSwap::from_pointee(Ring::default()),
            buckets,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn bucket(&self, key: &str) -> &Bucket {
        let idx = crc32fast::hash(key.as_bytes()) as usize % self.buckets.len();
        &self.buckets[idx]
    }

    /// Whether this node serves `key`; everything is served until a ring is installed
    pub fn owns(&self, key: &str) -> bool {
        match self.ring.load().hash(key) {
            Some(owner) => owner == self.node,
            None => true,
        }
    }

    fn check_owner(&self, key: &str) -> Result<()> {
        if self.owns(key) {
            return Ok(());
        }
        Err(PushError::Routing(format!(
            "key {} does not belong to node {}",
            key, self.node
        )))
    }

    /// Channel of `key`, created on demand when `create` is set
    pub fn get(&self, key: &str, create: bool) -> Result<Arc<Channel>> {
        self.check_owner(key)?;
        let mut bucket = self.bucket(key).lock();
        if let Some(channel) = bucket.get(key) {
            return Ok(channel.clone());
        }
        if !create {
            return Err(PushError::Routing(format!("channel {} not found", key)));
        }
        let channel = Arc::new(Channel::new(key, &self.config, self.sink.clone()));
        bucket.insert(key.to_string(), channel.clone());
        debug!("channel {} created", key);
        Ok(channel)
    }

    /// Push to the subscribers of `key`
    ///
    /// A key without subscribers gets no channel; its message is only saved.
    pub async fn push_msg(
        &self,
        key: &str,
        msg: serde_json::Value,
        gid: i32,
        expire: u64,
    ) -> Result<i64> {
        self.check_owner(key)?;
        let channel = self.bucket(key).lock().get(key).cloned();
        match channel {
            Some(channel) => channel.push_msg(msg, gid, expire).await,
            None => {
                let mid = store_msg(self.sink.as_ref(), key, &msg, gid, expire).await?;
                debug!("key {} has no subscribers, message {} stored only", key, mid);
                Ok(mid)
            }
        }
    }

    /// Get or create the channel of `key` and add a subscriber to it
    pub async fn subscribe(
        &self,
        key: &str,
        transport: SharedTransport,
        version: &str,
        cancel: CancellationToken,
    ) -> Result<(Arc<Channel>, ConnId)> {
        for _ in 0..SUBSCRIBE_ATTEMPTS {
            let channel = self.get(key, true)?;
            if channel.reserve()? {
                let id = channel.attach(transport, version, cancel).await?;
                return Ok((channel, id));
            }
        }
        Err(PushError::Routing(format!("channel {} keeps closing", key)))
    }

    /// Remove a subscriber, reclaiming its channel once empty
    pub fn remove_conn(&self, channel: &Arc<Channel>, id: ConnId) {
        if channel.remove_conn(id) > 0 {
            return;
        }
        let mut bucket = self.bucket(channel.key()).lock();
        let current = bucket
            .get(channel.key())
            .map(|c| Arc::ptr_eq(c, channel))
            .unwrap_or(false);
        if current && channel.retire_if_empty() {
            bucket.remove(channel.key());
            debug!("channel {} reclaimed", channel.key());
        }
    }

    /// Install the ring for `weights` and drop channels now owned elsewhere
    pub fn migrate(&self, weights: &HashMap<String, u32>) -> usize {
        let ring = Arc::new(Ring::from_weights(weights));
        self.ring.store(ring.clone());

        let mut moved = Vec::new();
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            let keys: Vec<String> = bucket
                .keys()
                .filter(|key| matches!(ring.hash(key), Some(owner) if owner != self.node))
                .cloned()
                .collect();
            for key in keys {
                if let Some(channel) = bucket.remove(&key) {
                    moved.push(channel);
                }
            }
        }
        for channel in &moved {
            channel.close();
        }
        info!(
            "node {} migrated to {} ring members, {} channels moved",
            self.node,
            weights.len(),
            moved.len()
        );
        moved.len()
    }

    /// Number of live channels
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every channel
    pub fn close(&self) -> usize {
        let mut closed = 0;
        for bucket in &self.buckets {
            let channels: Vec<Arc<Channel>> = bucket.lock().drain().map(|(_, c)| c).collect();
            for channel in channels {
                closed += channel.close();
            }
        }
        info!("closed {} subscriber connections", closed);
        closed
    }
}
