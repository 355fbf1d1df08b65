//! Scheduler error types.

use jobmesh_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] DbError),
}

impl SchedulerError {
    /// Whether the failed operation is worth retrying on the next tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::Store(e) => e.is_retryable(),
        }
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_follows_store_error() {
        assert!(SchedulerError::from(DbError::Timeout("claim".to_string())).is_retryable());
        assert!(!SchedulerError::from(DbError::NotFound("job".to_string())).is_retryable());
    }
}
