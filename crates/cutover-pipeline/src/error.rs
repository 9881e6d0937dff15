//! Pipeline error types.

use thiserror::Error;

use cutover_core::ActionKind;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rejected before execution; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] cutover_core::ConfigError),

    #[error("stage {stage} action {action}: missing artifact {artifact}")]
    MissingArtifact {
        stage: String,
        action: String,
        artifact: String,
    },

    #[error("artifact {name} not found in run {run_id}")]
    ArtifactNotFound { run_id: String, name: String },

    #[error("artifact payload at {location} does not match its digest")]
    CorruptArtifact { location: String },

    #[error("no executor registered for {0} actions")]
    NoExecutor(ActionKind),

    #[error("{0}")]
    ActionFailed(String),

    #[error("no pending approval for stage {stage} of run {run_id}")]
    ApprovalNotFound { run_id: String, stage: String },

    #[error("rejected{}", .comment.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    ApprovalRejected { comment: Option<String> },

    #[error("approval timed out after {0}s")]
    ApprovalTimedOut(u64),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("deployment error: {0}")]
    Rollout(#[from] cutover_rollout::RolloutError),

    #[error("state store error: {0}")]
    State(#[from] cutover_state::StateError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
