//! Weighted RPC connection pool
//!
//! A pool is a value object: membership changes build a new pool from the
//! members of the old one (sharing live handles) and the old pool is then
//! retired. `get` never blocks; it picks a healthy member at random with
//! probability proportional to its weight.

use crate::rpc::RpcClient;
use crate::types::ping_method;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One member handed to [`WeightedPool::new`]
#[derive(Debug, Clone)]
pub struct PoolMember {
    /// Lookup id (node id or address)
    pub id: String,
    pub addr: String,
    pub weight: u32,
    /// Already dialed handle, if any
    pub client: Option<RpcClient>,
}

impl PoolMember {
    pub fn new(id: impl Into<String>, addr: impl Into<String>, weight: u32) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            weight: weight.max(1),
            client: None,
        }
    }

    pub fn with_client(mut self, client: RpcClient) -> Self {
        self.client = Some(client);
        self
    }
}

struct Entry {
    id: String,
    addr: String,
    weight: u32,
    client: RwLock<Option<RpcClient>>,
    healthy: AtomicBool,
    reconnecting: AtomicBool,
}

impl Entry {
    fn live_client(&self) -> Option<RpcClient> {
        if !self.healthy.load(Ordering::Acquire) {
            return None;
        }
        self.client.read().clone().filter(|c| !c.is_closed())
    }

    fn mark_down(&self) {
        self.healthy.store(false, Ordering::Release);
        if let Some(client) = self.client.write().take() {
            client.close();
        }
    }
}

struct PoolInner {
    service: String,
    entries: Vec<Arc<Entry>>,
    retry: Duration,
    cancel: CancellationToken,
}

/// Weighted random RPC pool
#[derive(Clone)]
pub struct WeightedPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WeightedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightedPool")
            .field("service", &self.inner.service)
            .field("ids", &self.ids())
            .finish()
    }
}

impl WeightedPool {
    /// A pool without members
    pub fn empty(service: &str) -> Self {
        Self::new(service, Vec::new(), Duration::from_secs(1), Duration::from_secs(1), false)
    }

    /// Build a pool; with `start_ping` a prober pings every member each
    /// `ping` interval and redials failed ones after `retry`
    pub fn new(
        service: &str,
        members: Vec<PoolMember>,
        retry: Duration,
        ping: Duration,
        start_ping: bool,
    ) -> Self {
        let entries = members
            .into_iter()
            .map(|m| {
                let healthy = m.client.as_ref().map(|c| !c.is_closed()).unwrap_or(false);
                Arc::new(Entry {
                    id: m.id,
                    addr: m.addr,
                    weight: m.weight.max(1),
                    client: RwLock::new(m.client),
                    healthy: AtomicBool::new(healthy),
                    reconnecting: AtomicBool::new(false),
                })
            })
            .collect();

        let pool = Self {
            inner: Arc::new(PoolInner {
                service: service.to_string(),
                entries,
                retry,
                cancel: CancellationToken::new(),
            }),
        };
        if start_ping && !pool.inner.entries.is_empty() {
            pool.start_prober(ping);
        }
        pool
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Ids of every member, healthy or not
    pub fn ids(&self) -> Vec<String> {
        self.inner.entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.entries.iter().any(|e| e.id == id)
    }

    /// Number of members currently eligible for selection
    pub fn healthy_count(&self) -> usize {
        self.inner
            .entries
            .iter()
            .filter(|e| e.live_client().is_some())
            .count()
    }

    /// Weighted random pick among healthy members
    pub fn get(&self) -> Option<RpcClient> {
        let live: Vec<(u32, RpcClient)> = self
            .inner
            .entries
            .iter()
            .filter_map(|e| e.live_client().map(|c| (e.weight, c)))
            .collect();
        let total: u64 = live.iter().map(|(w, _)| *w as u64).sum();
        if total == 0 {
            return None;
        }
        let mut pick = rand::thread_rng().gen_range(0..total);
        for (weight, client) in live {
            if pick < weight as u64 {
                return Some(client);
            }
            pick -= weight as u64;
        }
        None
    }

    /// Healthy handle of a specific member
    pub fn get_by_id(&self, id: &str) -> Option<RpcClient> {
        self.inner
            .entries
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.live_client())
    }

    /// Address of a member
    pub fn addr_of(&self, id: &str) -> Option<String> {
        self.inner
            .entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.addr.clone())
    }

    /// Members with their live handles, for building a successor pool
    ///
    /// Handles are shared: this pool keeps serving whoever still holds it
    /// until it is [`retire`]d.
    ///
    /// [`retire`]: WeightedPool::retire
    pub fn members(&self) -> Vec<PoolMember> {
        self.inner
            .entries
            .iter()
            .map(|e| PoolMember {
                id: e.id.clone(),
                addr: e.addr.clone(),
                weight: e.weight,
                client: e.live_client(),
            })
            .collect()
    }

    /// Stop probing and close the handles `successor` did not take over
    pub fn retire(&self, successor: &WeightedPool) {
        self.inner.cancel.cancel();
        for entry in &self.inner.entries {
            let mut slot = entry.client.write();
            let reused = slot.as_ref().is_some_and(|client| successor.holds(client));
            if reused {
                continue;
            }
            if let Some(client) = slot.take() {
                debug!("{} pool: close superseded {}", self.inner.service, entry.addr);
                client.close();
            }
        }
    }

    fn holds(&self, client: &RpcClient) -> bool {
        self.inner.entries.iter().any(|e| {
            e.client
                .read()
                .as_ref()
                .is_some_and(|c| c.same_connection(client))
        })
    }

    /// Stop probing and close every handle of this pool
    pub fn destroy(&self) {
        self.inner.cancel.cancel();
        for entry in &self.inner.entries {
            if let Some(client) = entry.client.write().take() {
                debug!("{} pool: close {}", self.inner.service, entry.addr);
                client.close();
            }
            entry.healthy.store(false, Ordering::Release);
        }
    }

    fn start_prober(&self, ping: Duration) {
        let inner = self.inner.clone();
        let method = ping_method(&inner.service);
        tokio::spawn(async move {
            let mut ticker = interval(ping);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for entry in &inner.entries {
                    let client = entry.client.read().clone();
                    match client {
                        Some(client) if entry.healthy.load(Ordering::Acquire) => {
                            if let Err(e) = client.call::<_, serde_json::Value>(&method, &0).await {
                                warn!("{} {} failed: {}", method, entry.addr, e);
                                entry.mark_down();
                                schedule_reconnect(inner.clone(), entry.clone());
                            }
                        }
                        _ if entry.addr.is_empty() => {}
                        _ => schedule_reconnect(inner.clone(), entry.clone()),
                    }
                }
            }
            debug!("{} pool prober stopped", inner.service);
        });
    }
}

fn schedule_reconnect(inner: Arc<PoolInner>, entry: Arc<Entry>) {
    if entry.reconnecting.swap(true, Ordering::AcqRel) {
        return;
    }
    tokio::spawn(async move {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                entry.reconnecting.store(false, Ordering::Release);
                return;
            }
            _ = sleep(inner.retry) => {}
        }
        match RpcClient::dial(&entry.addr).await {
            Ok(client) => {
                // checked under the slot lock so a concurrent retire sees the handle
                let mut slot = entry.client.write();
                if inner.cancel.is_cancelled() {
                    client.close();
                } else {
                    info!("{} reconnected to {}", inner.service, entry.addr);
                    *slot = Some(client);
                    entry.healthy.store(true, Ordering::Release);
                }
            }
            Err(e) => warn!("{} reconnect {} failed: {}", inner.service, entry.addr, e),
        }
        entry.reconnecting.store(false, Ordering::Release);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::rpc::{encode_reply, serve, unknown_method, RpcService};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    struct Echo(&'static str);

    #[async_trait]
    impl RpcService for Echo {
        async fn call(&self, method: &str, _body: serde_json::Value) -> Result<serde_json::Value> {
            match method {
                "Test.Ping" => encode_reply(&0),
                "Test.Who" => encode_reply(&self.0),
                other => Err(unknown_method(other)),
            }
        }
    }

    async fn start(name: &'static str) -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::new(Echo(name)), cancel.clone()));
        (addr, cancel)
    }

    async fn member(id: &str, addr: &str, weight: u32) -> PoolMember {
        let client = RpcClient::dial(addr).await.unwrap();
        PoolMember::new(id, addr, weight).with_client(client)
    }

    #[tokio::test]
    async fn test_empty_pool_returns_none() {
        let pool = WeightedPool::empty("Test");
        assert!(pool.get().is_none());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_weighted_selection() {
        let (a, _ca) = start("a").await;
        let (b, _cb) = start("b").await;
        let pool = WeightedPool::new(
            "Test",
            vec![member("a", &a, 1).await, member("b", &b, 3).await],
            Duration::from_secs(1),
            Duration::from_secs(1),
            false,
        );
        let mut hits: HashMap<String, usize> = HashMap::new();
        for _ in 0..4000 {
            let client = pool.get().unwrap();
            *hits.entry(client.addr().to_string()).or_default() += 1;
        }
        let share_b = hits[&b] as f64 / 4000.0;
        assert!((share_b - 0.75).abs() < 0.05, "share of b = {}", share_b);
        pool.destroy();
    }

    #[tokio::test]
    async fn test_members_without_handle_are_skipped() {
        let (a, _ca) = start("a").await;
        let pool = WeightedPool::new(
            "Test",
            vec![member("a", &a, 1).await, PoolMember::new("b", "127.0.0.1:1", 5)],
            Duration::from_secs(1),
            Duration::from_secs(1),
            false,
        );
        for _ in 0..50 {
            assert_eq!(pool.get().unwrap().addr(), a);
        }
        assert!(pool.get_by_id("b").is_none());
        assert_eq!(pool.healthy_count(), 1);
    }

    #[tokio::test]
    async fn test_retired_pool_keeps_shared_handles() {
        let (a, _ca) = start("a").await;
        let (b, _cb) = start("b").await;
        let old = WeightedPool::new(
            "Test",
            vec![member("a", &a, 1).await, member("b", &b, 1).await],
            Duration::from_secs(1),
            Duration::from_secs(1),
            false,
        );
        let dropped = old.get_by_id("b").unwrap();
        let members: Vec<PoolMember> = old.members().into_iter().filter(|m| m.id == "a").collect();
        // the old pool still serves its holders while the successor is built
        assert!(old.get_by_id("a").is_some());

        let new = WeightedPool::new("Test", members, Duration::from_secs(1), Duration::from_secs(1), false);
        old.retire(&new);
        assert!(dropped.is_closed());
        let who: String = new.get_by_id("a").unwrap().call("Test.Who", &()).await.unwrap();
        assert_eq!(who, "a");
        let held: String = old.get_by_id("a").unwrap().call("Test.Who", &()).await.unwrap();
        assert_eq!(held, "a");
        new.destroy();
    }

    #[tokio::test]
    async fn test_destroy_closes_handles() {
        let (a, _ca) = start("a").await;
        let m = member("a", &a, 1).await;
        let client = m.client.clone().unwrap();
        let pool = WeightedPool::new("Test", vec![m], Duration::from_secs(1), Duration::from_secs(1), false);
        pool.destroy();
        assert!(client.is_closed());
        assert!(pool.get().is_none());
    }

    #[tokio::test]
    async fn test_prober_marks_down_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::new(Echo("a")), cancel.clone()));

        let pool = WeightedPool::new(
            "Test",
            vec![member("a", &addr, 1).await],
            Duration::from_millis(50),
            Duration::from_millis(50),
            true,
        );
        assert!(pool.get().is_some());

        // server goes away: connections drop and the prober marks the member down
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pool.get().is_none());

        // server comes back on the same address: the member is redialed
        let listener = TcpListener::bind(&addr).await.unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::new(Echo("a")), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(pool.get().is_some());

        pool.destroy();
        cancel.cancel();
    }
}
