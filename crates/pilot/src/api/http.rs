//! HTTP API
//!
//! Coordination operations over JSON. Every reply is an `ApiResponse`; failed
//! operations carry the stable error code of the coordination error.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use push_core::coord::pilot::{
    ApiResponse, CreateReply, CreateRequest, DataReply, PathQuery, SessionInfo, SetRequest,
    VersionReply, WatchQuery,
};
use push_core::coord::{Children, CoordError, CoordResult, WatchKind};

use crate::Pilot;

/// HTTP API service
pub struct HttpApi {
    pilot: Arc<Pilot>,
}

impl HttpApi {
    pub fn new(pilot: Arc<Pilot>) -> Self {
        Self { pilot }
    }

    pub fn router(self) -> Router {
        let pilot = self.pilot;

        Router::new()
            // Sessions
            .route("/api/v1/sessions", post(open_session))
            .route("/api/v1/sessions/:session_id/heartbeat", post(session_heartbeat))
            .route("/api/v1/sessions/:session_id", axum::routing::delete(close_session))
            // Tree
            .route("/api/v1/children", get(get_children))
            .route("/api/v1/data", get(get_data).put(set_data))
            .route("/api/v1/nodes", post(create_node).delete(delete_node))
            // Watches
            .route("/api/v1/watch/children", get(watch_children))
            .route("/api/v1/watch/data", get(watch_data))
            .route("/api/v1/stats", get(get_stats))
            .with_state(pilot)
    }
}

fn reply<T: Serialize>(result: CoordResult<T>) -> Json<ApiResponse<T>> {
    match result {
        Ok(data) => Json(ApiResponse::ok(data)),
        Err(e) => {
            debug!("Request failed: {}", e);
            Json(ApiResponse::err(&e))
        }
    }
}

#[derive(Deserialize)]
struct OpenSessionRequest {
    #[serde(default)]
    ttl_secs: u64,
}

#[derive(Serialize)]
struct Stats {
    nodes: usize,
    sessions: usize,
}

// Sessions
async fn open_session(
    State(pilot): State<Arc<Pilot>>,
    Json(req): Json<OpenSessionRequest>,
) -> Json<ApiResponse<SessionInfo>> {
    reply(Ok(pilot.sessions().open(req.ttl_secs)))
}

async fn session_heartbeat(
    State(pilot): State<Arc<Pilot>>,
    Path(session_id): Path<u64>,
) -> Json<ApiResponse<()>> {
    reply(pilot.sessions().heartbeat(session_id))
}

async fn close_session(
    State(pilot): State<Arc<Pilot>>,
    Path(session_id): Path<u64>,
) -> Json<ApiResponse<()>> {
    reply(pilot.sessions().close(session_id).map(|_| ()))
}

// Tree
async fn get_children(
    State(pilot): State<Arc<Pilot>>,
    Query(query): Query<PathQuery>,
) -> Json<ApiResponse<Children>> {
    reply(pilot.tree().children(&query.path))
}

async fn get_data(
    State(pilot): State<Arc<Pilot>>,
    Query(query): Query<PathQuery>,
) -> Json<ApiResponse<DataReply>> {
    reply(
        pilot
            .tree()
            .get(&query.path)
            .map(|(data, version)| DataReply { data, version }),
    )
}

async fn set_data(
    State(pilot): State<Arc<Pilot>>,
    Json(req): Json<SetRequest>,
) -> Json<ApiResponse<VersionReply>> {
    reply(
        pilot
            .tree()
            .set(&req.path, &req.data)
            .map(|version| VersionReply { version }),
    )
}

async fn create_node(
    State(pilot): State<Arc<Pilot>>,
    Json(req): Json<CreateRequest>,
) -> Json<ApiResponse<CreateReply>> {
    reply(create(&pilot, req))
}

fn create(pilot: &Pilot, req: CreateRequest) -> CoordResult<CreateReply> {
    let owner = if req.mode.is_ephemeral() {
        let session_id = req.session_id.ok_or(CoordError::SessionExpired)?;
        pilot.sessions().check(session_id)?;
        session_id
    } else {
        0
    };
    let path = pilot.tree().create(&req.path, &req.data, req.mode, owner)?;
    info!("Created {} ({:?})", path, req.mode);
    Ok(CreateReply { path })
}

async fn delete_node(
    State(pilot): State<Arc<Pilot>>,
    Query(query): Query<PathQuery>,
) -> Json<ApiResponse<()>> {
    let result = pilot.tree().delete(&query.path);
    if result.is_ok() {
        info!("Deleted {}", query.path);
    }
    reply(result)
}

// Watches
async fn watch(pilot: &Pilot, query: WatchQuery, kind: WatchKind) -> Json<ApiResponse<VersionReply>> {
    let version = pilot
        .tree()
        .wait(&query.path, kind, query.version, Some(pilot.watch_max_wait()))
        .await;
    reply(Ok(VersionReply { version }))
}

async fn watch_children(
    State(pilot): State<Arc<Pilot>>,
    Query(query): Query<WatchQuery>,
) -> Json<ApiResponse<VersionReply>> {
    watch(&pilot, query, WatchKind::Children).await
}

async fn watch_data(
    State(pilot): State<Arc<Pilot>>,
    Query(query): Query<WatchQuery>,
) -> Json<ApiResponse<VersionReply>> {
    watch(&pilot, query, WatchKind::Data).await
}

async fn get_stats(State(pilot): State<Arc<Pilot>>) -> Json<ApiResponse<Stats>> {
    reply(Ok(Stats {
        nodes: pilot.tree().len(),
        sessions: pilot.sessions().len(),
    }))
}
