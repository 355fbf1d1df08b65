//! Error types for jobmesh.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid job spec: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
