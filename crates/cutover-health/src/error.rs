//! Health check error types.

use thiserror::Error;

/// A health check that could not be evaluated.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("health source unavailable: {0}")]
    Unavailable(String),

    #[error("probe error: {0}")]
    Probe(String),
}

pub type HealthResult<T> = Result<T, HealthError>;
