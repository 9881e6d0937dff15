//! REST API handlers for deployment groups.
//!
//! Provides endpoints to inspect a group's current deployment, abort it,
//! and list archived attempts.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::warn;

use cutover_rollout::{DeploymentGroup, DeploymentStrategy};
use cutover_routing::TargetGroupPair;
use cutover_state::DeploymentRecord;

use crate::{ApiResponse, ApiState, error_response};

/// Serializable group status for API responses.
#[derive(serde::Serialize)]
pub struct GroupStatus {
    pub name: String,
    pub strategy: DeploymentStrategy,
    pub pair: TargetGroupPair,
    /// Latest deployment attempt, running or finished.
    pub deployment: Option<DeploymentRecord>,
}

/// Request body to abort a deployment.
#[derive(serde::Deserialize, Default)]
pub struct AbortRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

fn find<'a>(state: &'a ApiState, name: &str) -> Result<&'a DeploymentGroup, axum::response::Response> {
    state.groups.get(name).ok_or_else(|| {
        error_response(&format!("deployment group {name} not found"), StatusCode::NOT_FOUND).into_response()
    })
}

/// GET /api/v1/groups/{name}
pub async fn get_group(State(state): State<ApiState>, Path(name): Path<String>) -> impl IntoResponse {
    let group = match find(&state, &name) {
        Ok(group) => group,
        Err(resp) => return resp,
    };
    let status = GroupStatus {
        name: group.name().to_string(),
        strategy: group.strategy().clone(),
        pair: group.pair().await,
        deployment: group.status().await,
    };
    ApiResponse::ok(status).into_response()
}

/// POST /api/v1/groups/{name}/abort
pub async fn abort_group(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Option<Json<AbortRequest>>,
) -> impl IntoResponse {
    let group = match find(&state, &name) {
        Ok(group) => group,
        Err(resp) => return resp,
    };
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "operator abort".to_string());

    warn!(group = %name, reason = %reason, "abort requested");
    match group.abort(&reason).await {
        Some(record) => ApiResponse::ok(record).into_response(),
        None => error_response("group has never deployed", StatusCode::CONFLICT).into_response(),
    }
}

/// GET /api/v1/groups/{name}/history
pub async fn group_history(State(state): State<ApiState>, Path(name): Path<String>) -> impl IntoResponse {
    let group = match find(&state, &name) {
        Ok(group) => group,
        Err(resp) => return resp,
    };
    match group.history() {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}
