//! Rollout error types.

use thiserror::Error;

use cutover_state::DeploymentPhase;

#[derive(Debug, Error)]
pub enum RolloutError {
    /// Rejected before anything started; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("deployment {attempt} of group {group} is still in progress")]
    DeploymentInProgress { group: String, attempt: u64 },

    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition {
        from: DeploymentPhase,
        to: DeploymentPhase,
    },

    #[error("routing error: {0}")]
    Routing(#[from] cutover_routing::RoutingError),

    #[error("state store error: {0}")]
    State(#[from] cutover_state::StateError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
