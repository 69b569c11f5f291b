//! Fleet API of the orchestrator
//!
//! Every route except the operational ones needs the orchestrator's bearer
//! token. The acting user is named by `X-Requester-Id`; requesters listed as
//! admins may revoke credentials they do not own.

use super::agent::not_found;
use super::auth::{require_bearer, BearerToken};
use super::error::ApiError;
use super::health::{operational_router, ReadinessState};
use super::metrics::SharedMetrics;
use crate::fleet::{KeyOrchestrator, MirrorRecord, OrchestratorError, ServerDirectory};
use crate::monitor::{HealthSnapshot, HealthStatus};
use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

pub const REQUESTER_HEADER: &str = "x-requester-id";

#[derive(Clone)]
pub struct OrchestratorState {
    keys: Arc<KeyOrchestrator>,
    servers: Arc<dyn ServerDirectory>,
    health: watch::Receiver<HealthSnapshot>,
    admin_ids: Arc<[String]>,
}

impl OrchestratorState {
    pub fn new(
        keys: Arc<KeyOrchestrator>,
        servers: Arc<dyn ServerDirectory>,
        health: watch::Receiver<HealthSnapshot>,
        admin_ids: Vec<String>,
    ) -> Self {
        Self {
            keys,
            servers,
            health,
            admin_ids: admin_ids.into(),
        }
    }

    fn is_admin(&self, requester: &str) -> bool {
        self.admin_ids.iter().any(|id| id == requester)
    }
}

#[derive(Deserialize)]
struct IssueRequest {
    owner: Option<String>,
}

#[derive(Deserialize)]
struct KeysQuery {
    owner: Option<String>,
}

#[derive(Serialize)]
struct KeysResponse {
    owner: String,
    keys: Vec<MirrorRecord>,
}

#[derive(Serialize)]
struct ServerView {
    id: i64,
    name: String,
    address: String,
    port: u16,
    /// Absent until the monitor has probed the server once
    #[serde(skip_serializing_if = "Option::is_none")]
    health: Option<HealthStatus>,
}

async fn request_issue(
    State(state): State<OrchestratorState>,
    Path(server_id): Path<String>,
    body: Result<Json<IssueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MirrorRecord>), ApiError> {
    let server_id: i64 = server_id
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid serverId"))?;
    let owner = body
        .ok()
        .and_then(|Json(request)| request.owner)
        .ok_or_else(|| ApiError::bad_request("Missing or invalid owner"))?;

    let record = state.keys.request_issue(&owner, server_id).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn request_revoke(
    State(state): State<OrchestratorState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let id: i64 = id.parse().map_err(|_| ApiError::bad_request("Invalid key id"))?;
    let requester = headers
        .get(REQUESTER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("X-Requester-Id header required"))?;

    let privileged = state.is_admin(requester);
    state.keys.request_revoke(id, requester, privileged).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn keys_of(
    State(state): State<OrchestratorState>,
    query: Result<Query<KeysQuery>, QueryRejection>,
) -> Result<Json<KeysResponse>, ApiError> {
    let owner = query
        .ok()
        .and_then(|Query(q)| q.owner)
        .ok_or_else(|| ApiError::bad_request("Missing or invalid owner query parameter"))?;

    let keys = state.keys.keys_of(&owner).await?;
    Ok(Json(KeysResponse { owner, keys }))
}

async fn list_servers(
    State(state): State<OrchestratorState>,
) -> Result<Json<Vec<ServerView>>, ApiError> {
    let servers = state
        .servers
        .list_servers()
        .await
        .map_err(OrchestratorError::from)?;

    let snapshot = state.health.borrow().clone();
    let views = servers
        .into_iter()
        .map(|server| ServerView {
            health: snapshot.status_of(server.id),
            id: server.id,
            name: server.name,
            address: server.host,
            port: server.port,
        })
        .collect();
    Ok(Json(views))
}

/// Full orchestrator router: fleet API plus the operational endpoints
pub fn orchestrator_router(
    state: OrchestratorState,
    token: BearerToken,
    readiness: ReadinessState,
    metrics: SharedMetrics,
) -> Router {
    Router::new()
        .route("/servers", get(list_servers))
        .route("/servers/{server_id}/keys", post(request_issue))
        .route("/keys", get(keys_of))
        .route("/keys/{id}", delete(request_revoke))
        .route_layer(middleware::from_fn_with_state(token, require_bearer))
        .fallback(not_found)
        .with_state(state)
        .merge(operational_router(readiness, metrics))
}
