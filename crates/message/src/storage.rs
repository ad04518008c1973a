//! Message storage
//!
//! Messages are kept per key, ordered by message id, each with an absolute
//! expiry. Reads skip expired or undecodable entries and hand their ids to a
//! background cleaner through a bounded queue.

use crate::config::StorageConfig;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use push_core::types::{Message, PRIVATE_GROUP_ID};
use push_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Key prefix of conversation messages
pub const USER_MSG_NAMESPACE: &str = "userMsg";

/// Storage key of a session's conversation
pub fn user_msg_key(session_id: &str) -> String {
    format!("{}.{}", USER_MSG_NAMESPACE, session_id)
}

/// Backend of the message node
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Save one private message, expiring `expire` seconds from now
    async fn save_private(
        &self,
        key: &str,
        msg: serde_json::Value,
        mid: i64,
        expire: u64,
    ) -> Result<()>;

    /// Save the same message under several keys
    async fn save_privates(
        &self,
        keys: &[String],
        msg: serde_json::Value,
        mid: i64,
        expire: u64,
    ) -> Result<()>;

    /// Live messages of `key` with an id greater than `mid`, oldest first
    async fn get_private(&self, key: &str, mid: i64) -> Result<Vec<Message>>;

    /// Drop every message of `key`
    async fn del_private(&self, key: &str) -> Result<()>;

    /// Save a message a subscriber sent in a conversation
    async fn save_user_msg(
        &self,
        session_id: &str,
        msg: serde_json::Value,
        mid: i64,
        expire: u64,
    ) -> Result<()>;

    /// Live conversation messages of a session
    async fn get_user_msg(&self, session_id: &str) -> Result<Vec<Message>>;
}

/// Encoded form of one stored message
#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    msg: serde_json::Value,
    /// Unix seconds after which the message is dropped
    expire: i64,
}

/// Ids to delete from one key
#[derive(Debug)]
struct DeleteBatch {
    key: String,
    mids: Vec<i64>,
}

type Entries = BTreeMap<i64, Vec<u8>>;

/// In-process storage backend
pub struct MemoryStorage {
    data: RwLock<HashMap<String, Entries>>,
    max_store: usize,
    del_tx: mpsc::Sender<DeleteBatch>,
    del_rx: Mutex<Option<mpsc::Receiver<DeleteBatch>>>,
}

impl MemoryStorage {
    pub fn new(config: &StorageConfig) -> Arc<Self> {
        let (del_tx, del_rx) = mpsc::channel(config.delete_queue.max(1));
        Arc::new(Self {
            data: RwLock::new(HashMap::new()),
            max_store: config.max_store.max(1),
            del_tx,
            del_rx: Mutex::new(Some(del_rx)),
        })
    }

    /// Spawn the cleaner; `None` if it is already running
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self.del_rx.lock().take()?;
        let storage = self.clone();
        Some(tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = rx.recv() => match batch {
                        Some(batch) => batch,
                        None => break,
                    },
                };
                storage.remove(&batch);
            }
            info!("Message cleaner stopped");
        }))
    }

    /// Number of entries held for `key`, live or not
    pub fn stored(&self, key: &str) -> usize {
        self.data.read().get(key).map_or(0, BTreeMap::len)
    }

    fn save(&self, key: &str, msg: serde_json::Value, mid: i64, expire: u64) -> Result<()> {
        let stored = StoredMessage {
            msg,
            expire: now() + expire as i64,
        };
        let encoded = serde_json::to_vec(&stored)?;

        let mut data = self.data.write();
        let entries = data.entry(key.to_string()).or_default();
        entries.insert(mid, encoded);
        while entries.len() > self.max_store {
            entries.pop_first();
        }
        Ok(())
    }

    fn load(&self, key: &str, after: Option<i64>) -> Vec<Message> {
        let now = now();
        let mut msgs = Vec::new();
        let mut dead = Vec::new();
        {
            let data = self.data.read();
            let Some(entries) = data.get(key) else {
                return msgs;
            };
            let lower = match after {
                Some(mid) => Bound::Excluded(mid),
                None => Bound::Unbounded,
            };
            for (&mid, encoded) in entries.range((lower, Bound::Unbounded)) {
                let stored: StoredMessage = match serde_json::from_slice(encoded) {
                    Ok(stored) => stored,
                    Err(e) => {
                        warn!("key {} message {} is corrupt: {}", key, mid, e);
                        dead.push(mid);
                        continue;
                    }
                };
                if stored.expire < now {
                    debug!("key {} message {} expired", key, mid);
                    dead.push(mid);
                    continue;
                }
                msgs.push(Message {
                    msg: stored.msg,
                    mid,
                    gid: PRIVATE_GROUP_ID,
                });
            }
        }

        if !dead.is_empty() {
            let batch = DeleteBatch {
                key: key.to_string(),
                mids: dead,
            };
            match self.del_tx.try_send(batch) {
                Ok(()) => {}
                Err(TrySendError::Full(batch)) => {
                    warn!("key {} queue {} deletions failed, queue full", key, batch.mids.len())
                }
                Err(TrySendError::Closed(_)) => debug!("message cleaner is gone"),
            }
        }
        msgs
    }

    fn remove(&self, batch: &DeleteBatch) {
        let mut data = self.data.write();
        let Some(entries) = data.get_mut(&batch.key) else {
            return;
        };
        for mid in &batch.mids {
            entries.remove(mid);
        }
        if entries.is_empty() {
            data.remove(&batch.key);
        }
        debug!("key {} removed {} messages", batch.key, batch.mids.len());
    }

    #[cfg(test)]
    fn insert_raw(&self, key: &str, mid: i64, encoded: Vec<u8>) {
        self.data
            .write()
            .entry(key.to_string())
            .or_default()
            .insert(mid, encoded);
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_private(
        &self,
        key: &str,
        msg: serde_json::Value,
        mid: i64,
        expire: u64,
    ) -> Result<()> {
        self.save(key, msg, mid, expire)
    }

    async fn save_privates(
        &self,
        keys: &[String],
        msg: serde_json::Value,
        mid: i64,
        expire: u64,
    ) -> Result<()> {
        for key in keys {
            self.save(key, msg.clone(), mid, expire)?;
        }
        Ok(())
    }

    async fn get_private(&self, key: &str, mid: i64) -> Result<Vec<Message>> {
        Ok(self.load(key, Some(mid)))
    }

    async fn del_private(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn save_user_msg(
        &self,
        session_id: &str,
        msg: serde_json::Value,
        mid: i64,
        expire: u64,
    ) -> Result<()> {
        self.save(&user_msg_key(session_id), msg, mid, expire)
    }

    async fn get_user_msg(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self.load(&user_msg_key(session_id), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn storage(max_store: usize, delete_queue: usize) -> Arc<MemoryStorage> {
        MemoryStorage::new(&StorageConfig {
            max_store,
            delete_queue,
        })
    }

    fn stale(msg: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&StoredMessage {
            msg,
            expire: now() - 10,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_private_after_mid() {
        let s = storage(20, 16);
        for mid in 1..=3 {
            s.save_private("k", json!(mid), mid, 60).await.unwrap();
        }
        let msgs = s.get_private("k", 1).await.unwrap();
        let mids: Vec<i64> = msgs.iter().map(|m| m.mid).collect();
        assert_eq!(mids, vec![2, 3]);
        assert_eq!(msgs[0].msg, json!(2));
        assert_eq!(msgs[0].gid, PRIVATE_GROUP_ID);
        assert!(s.get_private("other", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trimmed_to_newest() {
        let s = storage(3, 16);
        for mid in 1..=5 {
            s.save_private("k", json!("m"), mid, 60).await.unwrap();
        }
        let mids: Vec<i64> = s
            .get_private("k", 0)
            .await
            .unwrap()
            .iter()
            .map(|m| m.mid)
            .collect();
        assert_eq!(mids, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_expired_and_corrupt_are_cleaned() {
        let s = storage(20, 16);
        let cancel = CancellationToken::new();
        s.start(cancel.clone()).unwrap();
        assert!(s.start(cancel.clone()).is_none());

        s.save_private("k", json!("live"), 3, 60).await.unwrap();
        s.insert_raw("k", 1, stale(json!("old")));
        s.insert_raw("k", 2, b"not json".to_vec());
        assert_eq!(s.stored("k"), 3);

        let msgs = s.get_private("k", 0).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].mid, 3);

        for _ in 0..100 {
            if s.stored("k") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(s.stored("k"), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_full_delete_queue_drops_batch() {
        // cleaner not started, queue holds one batch
        let s = storage(20, 1);
        s.insert_raw("a", 1, stale(json!(1)));
        s.insert_raw("b", 1, stale(json!(1)));
        assert!(s.get_private("a", 0).await.unwrap().is_empty());
        assert!(s.get_private("b", 0).await.unwrap().is_empty());

        s.start(CancellationToken::new()).unwrap();
        for _ in 0..100 {
            if s.stored("a") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(s.stored("a"), 0);
        assert_eq!(s.stored("b"), 1);
    }

    #[tokio::test]
    async fn test_user_messages_live_in_their_namespace() {
        let s = storage(20, 16);
        s.save_user_msg("s1", json!("hi"), 7, 60).await.unwrap();
        assert_eq!(s.stored("userMsg.s1"), 1);
        assert!(s.get_private("s1", 0).await.unwrap().is_empty());

        let msgs = s.get_user_msg("s1").await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg, json!("hi"));
    }

    #[tokio::test]
    async fn test_save_privates_and_delete() {
        let s = storage(20, 16);
        let keys = vec!["a".to_string(), "b".to_string()];
        s.save_privates(&keys, json!("all"), 5, 60).await.unwrap();
        assert_eq!(s.get_private("a", 0).await.unwrap().len(), 1);
        assert_eq!(s.get_private("b", 0).await.unwrap().len(), 1);

        s.del_private("a").await.unwrap();
        assert!(s.get_private("a", 0).await.unwrap().is_empty());
        assert_eq!(s.stored("b"), 1);
    }
}
