//! Provisioning API served by the agent on every endpoint server
//!
//! - `POST /generate-key {userId}` issue a credential (201)
//! - `DELETE /reject-key/{keyId}` revoke a credential (204)
//! - `GET /keys-of?userId=` list credentials of one owner
//! - `GET /health-check` xray state and version, no auth
//!
//! All other routes answer 404 `{error: "Not Found"}`.

use super::auth::{require_bearer, BearerToken};
use super::error::ApiError;
use super::health::{operational_router, ReadinessState};
use super::metrics::SharedMetrics;
use crate::provision::{CredentialView, IssuedCredential, KeyProvisioner};
use crate::xray::ServiceState;
use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AgentState {
    provisioner: Arc<KeyProvisioner>,
}

impl AgentState {
    pub fn new(provisioner: Arc<KeyProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateKeyRequest {
    user_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeysOfQuery {
    user_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeysOfResponse {
    user_id: String,
    keys: Vec<CredentialView>,
}

#[derive(Serialize)]
struct HealthCheckResponse {
    status: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

async fn generate_key(
    State(state): State<AgentState>,
    body: Result<Json<GenerateKeyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IssuedCredential>), ApiError> {
    let user_id = body
        .ok()
        .and_then(|Json(request)| request.user_id)
        .ok_or_else(|| ApiError::bad_request("Missing or invalid userId"))?;

    let issued = state.provisioner.issue(&user_id).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn reject_key(
    State(state): State<AgentState>,
    Path(key_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key_id: i64 = key_id
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid keyId"))?;

    state.provisioner.revoke(key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn keys_of(
    State(state): State<AgentState>,
    query: Result<Query<KeysOfQuery>, QueryRejection>,
) -> Result<Json<KeysOfResponse>, ApiError> {
    let user_id = query
        .ok()
        .and_then(|Query(q)| q.user_id)
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing or invalid userId query parameter"))?;

    let keys = state.provisioner.list(&user_id).await?;
    Ok(Json(KeysOfResponse { user_id, keys }))
}

async fn health_check(State(state): State<AgentState>) -> Response {
    match state.provisioner.status().await {
        Ok(status) => Json(HealthCheckResponse {
            status: status.state,
            version: status.version,
        })
        .into_response(),
        Err(e) => {
            error!(error = %e, "health-check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "failed", "version": "", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub(super) async fn not_found() -> ApiError {
    ApiError::not_found("Not Found")
}

/// Full agent router: provisioning API plus the operational endpoints
pub fn agent_router(
    state: AgentState,
    token: BearerToken,
    readiness: ReadinessState,
    metrics: SharedMetrics,
) -> Router {
    // route_layer: unknown paths fall through to the 404 fallback, not 401
    let protected = Router::new()
        .route("/generate-key", post(generate_key))
        .route("/reject-key/{key_id}", delete(reject_key))
        .route("/keys-of", get(keys_of))
        .route_layer(middleware::from_fn_with_state(token, require_bearer));

    Router::new()
        .merge(protected)
        .route("/health-check", get(health_check))
        .fallback(not_found)
        .with_state(state)
        .merge(operational_router(readiness, metrics))
}
