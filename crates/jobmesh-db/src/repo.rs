//! Repository traits and implementations.
//!
//! Each concern of the job store is its own trait. `PgJobOrm` implements
//! all of them against PostgreSQL; `MemoryJobOrm` (in `crate::memory`)
//! implements them in process for tests.

pub mod claim;
pub mod job;
pub mod job_error;
pub mod log_level;
pub mod notify;
pub mod run;

pub use claim::ClaimRepo;
pub use job::JobRepo;
pub use job_error::JobErrorRepo;
pub use log_level::LogLevelRepo;
pub use notify::JobNotifier;
pub use run::RunRepo;

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{DbError, DbResult};

/// Default age after which an unrenewed claim is treated as abandoned.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Everything a node needs from the shared store.
#[async_trait]
pub trait JobOrm: JobRepo + ClaimRepo + RunRepo + JobErrorRepo + JobNotifier {
    /// Close all store connections and end every open subscription.
    async fn close(&self) -> DbResult<()>;
}

/// PostgreSQL implementation of the job store.
pub struct PgJobOrm {
    pool: PgPool,
    lease_ttl: Duration,
    shutdown: CancellationToken,
}

impl PgJobOrm {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease_ttl: DEFAULT_LEASE_TTL,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }
}

#[async_trait]
impl JobOrm for PgJobOrm {
    async fn close(&self) -> DbResult<()> {
        self.shutdown.cancel();
        self.pool.close().await;
        info!("Job store closed");
        Ok(())
    }
}

/// Reject negative pagination arguments before they reach SQL.
pub(crate) fn check_page(offset: i64, limit: i64) -> DbResult<()> {
    if offset < 0 || limit < 0 {
        return Err(DbError::Validation(format!(
            "offset and limit must be non-negative (offset={}, limit={})",
            offset, limit
        )));
    }
    Ok(())
}
