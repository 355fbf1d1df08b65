//! Shared job store for jobmesh.
//!
//! Provides the store traits, the PostgreSQL implementation, an in-process
//! implementation, and change notification subscriptions.

pub mod backoff;
pub mod error;
pub mod memory;
pub mod repo;
pub mod subscription;

pub use backoff::Backoff;
pub use error::{DbError, DbResult};
pub use memory::MemoryJobOrm;
pub use repo::*;
pub use subscription::{DELETED_JOBS_CHANNEL, NEW_JOBS_CHANNEL, Subscription};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::future::Future;
use std::time::Duration;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Bound a store call by `deadline`. An elapsed deadline fails with
/// `DbError::Timeout` and drops the call.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(DbError::Timeout(format!(
            "store call exceeded {:?}",
            deadline
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use jobmesh_core::{JobType, NewJob, PipelineSpec, Task, TaskKind};

    /// A store on the database named by `DATABASE_URL`, migrated.
    pub async fn pg_orm() -> PgJobOrm {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = create_pool(&url).await.expect("connect to database");
        run_migrations(&pool).await.expect("run migrations");
        PgJobOrm::new(pool)
    }

    pub fn sample_job(name: &str) -> NewJob {
        NewJob::new(
            name,
            JobType::Cron,
            PipelineSpec::new(vec![Task {
                name: "fetch".to_string(),
                needs: vec![],
                kind: TaskKind::Http {
                    method: "GET".to_string(),
                    url: "https://example.com/price".to_string(),
                },
            }]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_deadline_passes_result_through() {
        let value = with_deadline(Duration::from_secs(1), async { Ok::<_, DbError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let err = with_deadline(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, DbError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DbError::Timeout(_)));
        assert!(err.is_retryable());
    }
}
