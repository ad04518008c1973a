//! Pilot coordination service client
//!
//! Opens a session on connect and keeps it alive with a background heartbeat.
//! Watches are long polls against the pilot HTTP API.

use super::{Children, CoordError, CoordResult, CoordStore, CreateMode};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest time the pilot holds a watch request open
pub const WATCH_MAX_WAIT: Duration = Duration::from_secs(30);

/// Envelope of every pilot API reply
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    /// Stable error code, see [`CoordError::code`]
    pub code: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn err(e: &CoordError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(e.to_string()),
            code: Some(e.code().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: u64,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReply {
    pub data: Vec<u8>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRequest {
    pub path: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub path: String,
    #[serde(default)]
    pub data: Vec<u8>,
    pub mode: CreateMode,
    /// Owner of ephemeral nodes
    #[serde(default)]
    pub session_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReply {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchQuery {
    pub path: String,
    pub version: u64,
}

/// Pilot client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotStoreConfig {
    /// Pilot base url
    pub pilot_addr: String,
    /// Requested session ttl (seconds)
    pub session_ttl_secs: u64,
    /// Per request timeout (seconds), watches add the pilot's max wait
    pub request_timeout_secs: u64,
}

impl Default for PilotStoreConfig {
    fn default() -> Self {
        Self {
            pilot_addr: "http://127.0.0.1:8080".to_string(),
            session_ttl_secs: 10,
            request_timeout_secs: 5,
        }
    }
}

struct Inner {
    config: PilotStoreConfig,
    http_client: reqwest::Client,
    session_id: u64,
    /// Stops the heartbeat
    shutdown: CancellationToken,
    /// Cancelled once the pilot reports the session gone
    session_lost: CancellationToken,
}

/// [`CoordStore`] backed by the pilot service
#[derive(Clone)]
pub struct PilotStore {
    inner: Arc<Inner>,
}

impl PilotStore {
    /// Open a session and start its heartbeat
    pub async fn connect(config: PilotStoreConfig) -> CoordResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(transport)?;

        #[derive(Serialize)]
        struct OpenRequest {
            ttl_secs: u64,
        }

        let url = format!("{}/api/v1/sessions", config.pilot_addr);
        let resp: ApiResponse<SessionInfo> = http_client
            .post(&url)
            .json(&OpenRequest {
                ttl_secs: config.session_ttl_secs,
            })
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        let session = unwrap_response(resp)?;
        info!(
            "Opened pilot session {} at {} (ttl {}s)",
            session.session_id, config.pilot_addr, session.ttl_secs
        );

        let store = Self {
            inner: Arc::new(Inner {
                config,
                http_client,
                session_id: session.session_id,
                shutdown: CancellationToken::new(),
                session_lost: CancellationToken::new(),
            }),
        };
        store.start_heartbeat(Duration::from_secs(session.ttl_secs.max(3) / 3));
        Ok(store)
    }

    pub fn session_id(&self) -> u64 {
        self.inner.session_id
    }

    /// Cancelled when the pilot no longer knows this session
    pub fn session_lost(&self) -> CancellationToken {
        self.inner.session_lost.clone()
    }

    /// Stop the heartbeat and close the session, dropping its ephemeral nodes
    pub async fn close(&self) -> CoordResult<()> {
        self.inner.shutdown.cancel();
        let url = format!(
            "{}/api/v1/sessions/{}",
            self.inner.config.pilot_addr, self.inner.session_id
        );
        let resp: ApiResponse<()> = self
            .inner
            .http_client
            .delete(&url)
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        check_response(resp)?;
        info!("Closed pilot session {}", self.inner.session_id);
        Ok(())
    }

    fn start_heartbeat(&self, period: Duration) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = store.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.heartbeat().await {
                    Ok(()) => debug!("Heartbeat sent for session {}", store.inner.session_id),
                    Err(CoordError::SessionExpired) => {
                        error!("Pilot session {} expired", store.inner.session_id);
                        store.inner.session_lost.cancel();
                        break;
                    }
                    Err(e) => warn!("Session heartbeat failed: {}", e),
                }
            }
        });
    }

    async fn heartbeat(&self) -> CoordResult<()> {
        let url = format!(
            "{}/api/v1/sessions/{}/heartbeat",
            self.inner.config.pilot_addr, self.inner.session_id
        );
        let resp: ApiResponse<()> = self
            .inner
            .http_client
            .post(&url)
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        check_response(resp)
    }

    fn url(&self, route: &str) -> String {
        format!("{}/api/v1/{}", self.inner.config.pilot_addr, route)
    }

    async fn get_json<Q: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        route: &str,
        query: &Q,
        timeout: Duration,
    ) -> CoordResult<T> {
        let resp: ApiResponse<T> = self
            .inner
            .http_client
            .get(self.url(route))
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        unwrap_response(resp)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.inner.config.request_timeout_secs)
    }

    /// Long poll until the version of `route` at `path` moves past `version`
    async fn watch(&self, route: &str, path: &str, version: u64) -> CoordResult<u64> {
        let timeout = WATCH_MAX_WAIT + self.request_timeout();
        loop {
            let query = WatchQuery {
                path: path.to_string(),
                version,
            };
            let reply: VersionReply = self.get_json(route, &query, timeout).await?;
            if reply.version != version {
                return Ok(reply.version);
            }
        }
    }
}

#[async_trait]
impl CoordStore for PilotStore {
    async fn children(&self, path: &str) -> CoordResult<Children> {
        let query = PathQuery {
            path: path.to_string(),
        };
        self.get_json("children", &query, self.request_timeout())
            .await
    }

    async fn wait_children(&self, path: &str, version: u64) -> CoordResult<u64> {
        self.watch("watch/children", path, version).await
    }

    async fn get(&self, path: &str) -> CoordResult<(Vec<u8>, u64)> {
        let query = PathQuery {
            path: path.to_string(),
        };
        let reply: DataReply = self
            .get_json("data", &query, self.request_timeout())
            .await?;
        Ok((reply.data, reply.version))
    }

    async fn wait_data(&self, path: &str, version: u64) -> CoordResult<u64> {
        self.watch("watch/data", path, version).await
    }

    async fn set(&self, path: &str, data: &[u8]) -> CoordResult<u64> {
        let req = SetRequest {
            path: path.to_string(),
            data: data.to_vec(),
        };
        let resp: ApiResponse<VersionReply> = self
            .inner
            .http_client
            .put(self.url("data"))
            .json(&req)
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        Ok(unwrap_response(resp)?.version)
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        let req = CreateRequest {
            path: path.to_string(),
            data: data.to_vec(),
            mode,
            session_id: mode.is_ephemeral().then_some(self.inner.session_id),
        };
        let resp: ApiResponse<CreateReply> = self
            .inner
            .http_client
            .post(self.url("nodes"))
            .json(&req)
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        Ok(unwrap_response(resp)?.path)
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        let query = PathQuery {
            path: path.to_string(),
        };
        let resp: ApiResponse<()> = self
            .inner
            .http_client
            .delete(self.url("nodes"))
            .query(&query)
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        check_response(resp)
    }

    async fn exists(&self, path: &str) -> CoordResult<bool> {
        match self.get(path).await {
            Ok(_) => Ok(true),
            Err(CoordError::NoNode(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn transport(e: reqwest::Error) -> CoordError {
    CoordError::Transport(e.to_string())
}

fn response_error<T>(resp: ApiResponse<T>) -> CoordError {
    let message = resp.error.unwrap_or_default();
    match resp.code {
        Some(code) => CoordError::from_code(&code, message),
        None => CoordError::Transport(message),
    }
}

fn unwrap_response<T>(resp: ApiResponse<T>) -> CoordResult<T> {
    if !resp.success {
        return Err(response_error(resp));
    }
    resp.data
        .ok_or_else(|| CoordError::Transport("missing response data".to_string()))
}

fn check_response(resp: ApiResponse<()>) -> CoordResult<()> {
    if resp.success {
        Ok(())
    } else {
        Err(response_error(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_maps_code() {
        let resp: ApiResponse<()> = ApiResponse::err(&CoordError::NoNode("/a".to_string()));
        let json = serde_json::to_string(&resp).unwrap();
        let back: ApiResponse<()> = serde_json::from_str(&json).unwrap();
        assert!(matches!(check_response(back), Err(CoordError::NoNode(_))));
    }

    #[test]
    fn test_missing_data_is_transport_error() {
        let resp: ApiResponse<VersionReply> = ApiResponse {
            success: true,
            data: None,
            error: None,
            code: None,
        };
        assert!(matches!(
            unwrap_response(resp),
            Err(CoordError::Transport(_))
        ));
    }

    #[test]
    fn test_create_request_layout() {
        let req = CreateRequest {
            path: "/comet/n1/".to_string(),
            data: b"{}".to_vec(),
            mode: CreateMode::EphemeralSequential,
            session_id: Some(7),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["mode"], "ephemeral_sequential");
        assert_eq!(value["session_id"], 7);
    }
}
