//! cutover-api — REST API for cutover.
//!
//! Provides axum route handlers for triggering and inspecting pipeline
//! runs, delivering approval decisions, and watching or aborting
//! deployment groups.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/triggers` | Start a run for a pushed commit |
//! | GET | `/api/v1/runs` | List runs, newest first |
//! | GET | `/api/v1/runs/{id}` | Run status |
//! | POST | `/api/v1/runs/{id}/cancel` | Cancel a run |
//! | GET | `/api/v1/approvals` | Pending approvals |
//! | POST | `/api/v1/approvals` | Deliver an approval decision |
//! | GET | `/api/v1/groups/{name}` | Deployment group status |
//! | POST | `/api/v1/groups/{name}/abort` | Abort the active deployment |
//! | GET | `/api/v1/groups/{name}/history` | Archived deployments |

pub mod group_handlers;
pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};

use cutover_pipeline::{ApprovalGate, PipelineRunner};
use cutover_rollout::DeploymentGroup;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub runner: PipelineRunner,
    pub gate: ApprovalGate,
    pub groups: Arc<HashMap<String, DeploymentGroup>>,
}

impl ApiState {
    pub fn new(runner: PipelineRunner, gate: ApprovalGate, groups: Vec<DeploymentGroup>) -> Self {
        Self {
            runner,
            gate,
            groups: Arc::new(
                groups
                    .into_iter()
                    .map(|g| (g.name().to_string(), g))
                    .collect(),
            ),
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/triggers", post(handlers::trigger_run))
        .route("/runs", get(handlers::list_runs))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/runs/{id}/cancel", post(handlers::cancel_run))
        .route(
            "/approvals",
            get(handlers::list_approvals).post(handlers::decide_approval),
        )
        .route("/groups/{name}", get(group_handlers::get_group))
        .route("/groups/{name}/abort", post(group_handlers::abort_group))
        .route("/groups/{name}/history", get(group_handlers::group_history))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}
