//! Pipeline handlers: triggers, runs, approvals.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::info;

use cutover_pipeline::{ApprovalDecision, PipelineError, Trigger};

use crate::{ApiResponse, ApiState, error_response};

fn pipeline_error(e: &PipelineError) -> axum::response::Response {
    let status = match e {
        PipelineError::RunNotFound(_) | PipelineError::ApprovalNotFound { .. } => StatusCode::NOT_FOUND,
        PipelineError::Configuration(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Triggers ───────────────────────────────────────────────────

/// POST /api/v1/triggers
pub async fn trigger_run(
    State(state): State<ApiState>,
    Json(trigger): Json<Trigger>,
) -> impl IntoResponse {
    let branch = trigger.branch.clone();
    match state.runner.trigger(trigger) {
        Ok(Some(run)) => (StatusCode::CREATED, ApiResponse::ok(run)).into_response(),
        Ok(None) => ApiResponse::ok(serde_json::json!({
            "ignored": true,
            "branch": branch,
            "tracked_branch": state.runner.definition().branch,
        }))
        .into_response(),
        Err(e) => pipeline_error(&e),
    }
}

// ── Runs ───────────────────────────────────────────────────────

/// GET /api/v1/runs
pub async fn list_runs(State(state): State<ApiState>) -> impl IntoResponse {
    match state.runner.list() {
        Ok(runs) => ApiResponse::ok(runs).into_response(),
        Err(e) => pipeline_error(&e),
    }
}

/// GET /api/v1/runs/{id}
pub async fn get_run(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.runner.get(&id) {
        Ok(run) => ApiResponse::ok(run).into_response(),
        Err(e) => pipeline_error(&e),
    }
}

/// POST /api/v1/runs/{id}/cancel
pub async fn cancel_run(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.runner.cancel(&id) {
        Ok(run) => ApiResponse::ok(run).into_response(),
        Err(e) => pipeline_error(&e),
    }
}

// ── Approvals ──────────────────────────────────────────────────

/// GET /api/v1/approvals
pub async fn list_approvals(State(state): State<ApiState>) -> impl IntoResponse {
    let mut pending = state.gate.pending();
    pending.sort_by_key(|r| r.requested_at);
    ApiResponse::ok(pending).into_response()
}

/// POST /api/v1/approvals
pub async fn decide_approval(
    State(state): State<ApiState>,
    Json(decision): Json<ApprovalDecision>,
) -> impl IntoResponse {
    info!(run_id = %decision.run_id, stage = %decision.stage, "approval decision received");
    match state.gate.decide(decision.clone()) {
        Ok(()) => ApiResponse::ok(decision).into_response(),
        Err(e) => pipeline_error(&e),
    }
}
