//! Session management module
//!
//! Responsible for session open, heartbeat, and expiry of silent sessions

use parking_lot::Mutex;
use push_core::coord::pilot::SessionInfo;
use push_core::coord::{CoordError, CoordResult, Tree};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ttl granted when the client asks for none (seconds)
    pub default_ttl_secs: u64,
    /// Upper bound of a granted ttl (seconds)
    pub max_ttl_secs: u64,
    /// Expiry check interval (milliseconds)
    pub check_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 10,
            max_ttl_secs: 60,
            check_interval_ms: 1000,
        }
    }
}

impl SessionConfig {
    pub(crate) fn merge(&mut self, other: Self) {
        if other.default_ttl_secs > 0 {
            self.default_ttl_secs = other.default_ttl_secs;
        }
        if other.max_ttl_secs > 0 {
            self.max_ttl_secs = other.max_ttl_secs;
        }
        if other.check_interval_ms > 0 {
            self.check_interval_ms = other.check_interval_ms;
        }
    }
}

#[derive(Debug)]
struct Session {
    ttl: Duration,
    last_heartbeat: Instant,
}

impl Session {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_heartbeat) > self.ttl
    }
}

/// Session manager
pub struct SessionManager {
    config: SessionConfig,
    tree: Arc<Tree>,
    sessions: Mutex<HashMap<u64, Session>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, tree: Arc<Tree>) -> Self {
        Self {
            config,
            tree,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a session; a zero ttl means the default
    pub fn open(&self, ttl_secs: u64) -> SessionInfo {
        let ttl_secs = match ttl_secs {
            0 => self.config.default_ttl_secs,
            ttl => ttl.min(self.config.max_ttl_secs),
        };
        let session_id = self.tree.new_session();
        self.sessions.lock().insert(
            session_id,
            Session {
                ttl: Duration::from_secs(ttl_secs),
                last_heartbeat: Instant::now(),
            },
        );
        info!("Session {} opened (ttl {}s)", session_id, ttl_secs);
        SessionInfo {
            session_id,
            ttl_secs,
        }
    }

    /// Refresh a session
    pub fn heartbeat(&self, session_id: u64) -> CoordResult<()> {
        match self.sessions.lock().get_mut(&session_id) {
            Some(session) => {
                session.last_heartbeat = Instant::now();
                debug!("Heartbeat from session {}", session_id);
                Ok(())
            }
            None => {
                warn!("Heartbeat from unknown session {}", session_id);
                Err(CoordError::SessionExpired)
            }
        }
    }

    /// Fail unless `session_id` is alive
    pub fn check(&self, session_id: u64) -> CoordResult<()> {
        if self.sessions.lock().contains_key(&session_id) {
            Ok(())
        } else {
            Err(CoordError::SessionExpired)
        }
    }

    /// Close a session and delete its ephemeral nodes
    pub fn close(&self, session_id: u64) -> CoordResult<usize> {
        if self.sessions.lock().remove(&session_id).is_none() {
            return Err(CoordError::SessionExpired);
        }
        let removed = self.tree.close_session(session_id);
        info!("Session {} closed, {} ephemeral nodes removed", session_id, removed);
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Start expiry checker task
    pub fn start_checker(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let check_interval = Duration::from_millis(self.config.check_interval_ms);
        tokio::spawn(async move {
            let mut interval = interval(check_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                self.expire_silent();
            }
        })
    }

    /// Expire every session silent for longer than its ttl
    pub fn expire_silent(&self) -> Vec<u64> {
        let now = Instant::now();
        let expired: Vec<u64> = {
            let mut sessions = self.sessions.lock();
            let expired: Vec<u64> = sessions
                .iter()
                .filter(|(_, s)| s.is_expired(now))
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                sessions.remove(id);
            }
            expired
        };

        for id in &expired {
            let removed = self.tree.close_session(*id);
            warn!("Session {} expired, {} ephemeral nodes removed", id, removed);
        }
        expired
    }
}
