//! Routing error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("unknown target group: {0}")]
    UnknownGroup(String),

    #[error("unknown listener: {0}")]
    UnknownListener(String),

    #[error("invalid weight split: blue {blue} + green {green} != 100")]
    InvalidSplit { blue: u8, green: u8 },

    #[error("load balancer error: {0}")]
    Backend(String),
}

pub type RoutingResult<T> = Result<T, RoutingError>;
