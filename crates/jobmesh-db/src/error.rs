//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("job {job} is claimed by {owner}")]
    Ownership { job: String, owner: String },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("store unavailable: {0}")]
    Transient(String),

    #[error("notification delivery failed: {0}")]
    Delivery(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::Timeout(_) | DbError::Transient(_) | DbError::Delivery(_)
        )
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return DbError::Duplicate(db.message().to_string());
            }
            if db.is_foreign_key_violation() {
                return DbError::NotFound(db.message().to_string());
            }
        }
        if matches!(
            err,
            sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
        ) {
            return DbError::Transient(err.to_string());
        }
        DbError::Database(err)
    }
}

impl From<jobmesh_core::Error> for DbError {
    fn from(err: jobmesh_core::Error) -> Self {
        match err {
            jobmesh_core::Error::NotFound(msg) => DbError::NotFound(msg),
            jobmesh_core::Error::Validation(msg) => DbError::Validation(msg),
            jobmesh_core::Error::Conflict(msg) => DbError::Duplicate(msg),
            jobmesh_core::Error::Timeout(msg) => DbError::Timeout(msg),
            other => DbError::InvalidData(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
