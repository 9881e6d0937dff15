//! State store errors.
//!
//! redb's error types are flattened to strings at the store boundary so
//! callers never depend on the storage engine.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state database: {0}")]
    Open(String),

    /// Begin or commit failed.
    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("state table unavailable: {0}")]
    Table(String),

    #[error("state read failed: {0}")]
    Read(String),

    #[error("state write failed: {0}")]
    Write(String),

    #[error("cannot encode record: {0}")]
    Serialize(String),

    /// A stored value no longer matches its record type.
    #[error("stored record is unreadable: {0}")]
    Deserialize(String),
}
