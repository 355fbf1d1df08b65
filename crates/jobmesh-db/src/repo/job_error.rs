//! Job error repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobmesh_core::{JobError, ResourceId};

use super::PgJobOrm;
use crate::{DbError, DbResult};

/// Database row for job errors.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobErrorRow {
    pub id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub description: String,
    pub occurrences: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dismissed_at: Option<DateTime<Utc>>,
}

impl From<JobErrorRow> for JobError {
    fn from(row: JobErrorRow) -> Self {
        JobError {
            id: row.id.into(),
            job_id: row.job_id.into(),
            description: row.description,
            occurrences: row.occurrences,
            created_at: row.created_at,
            updated_at: row.updated_at,
            dismissed_at: row.dismissed_at,
        }
    }
}

#[async_trait]
pub trait JobErrorRepo: Send + Sync {
    /// Append an error for a job. Repeating an undismissed description bumps
    /// its occurrence count.
    async fn record_error(&self, job_id: ResourceId, description: &str) -> DbResult<JobError>;

    /// Mark an error dismissed. Dismissing twice is a no-op.
    async fn dismiss_error(&self, id: ResourceId) -> DbResult<()>;

    /// Undismissed errors for a job, most recently updated first.
    async fn job_errors(&self, job_id: ResourceId) -> DbResult<Vec<JobError>>;
}

#[async_trait]
impl JobErrorRepo for PgJobOrm {
    async fn record_error(&self, job_id: ResourceId, description: &str) -> DbResult<JobError> {
        let row = sqlx::query_as::<_, JobErrorRow>(
            r#"
            INSERT INTO job_errors (id, job_id, description, occurrences, created_at, updated_at)
            VALUES ($1, $2, $3, 1, NOW(), NOW())
            ON CONFLICT (job_id, description) WHERE dismissed_at IS NULL
            DO UPDATE SET occurrences = job_errors.occurrences + 1, updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(job_id.as_uuid())
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::NotFound(_) => DbError::NotFound(format!("job {}", job_id)),
            other => other,
        })?;
        Ok(row.into())
    }

    async fn dismiss_error(&self, id: ResourceId) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE job_errors SET dismissed_at = COALESCE(dismissed_at, NOW()) WHERE id = $1",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job error {}", id)));
        }
        Ok(())
    }

    async fn job_errors(&self, job_id: ResourceId) -> DbResult<Vec<JobError>> {
        let rows = sqlx::query_as::<_, JobErrorRow>(
            r#"
            SELECT * FROM job_errors
            WHERE job_id = $1 AND dismissed_at IS NULL
            ORDER BY updated_at DESC, id DESC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(JobError::from).collect())
    }
}
