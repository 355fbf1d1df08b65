//! Pipeline run repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobmesh_core::evaluator::RunOutcome;
use jobmesh_core::{PipelineRun, ResourceId, RunStatus};

use super::{PgJobOrm, check_page};
use crate::{DbError, DbResult};

/// Database row for pipeline runs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct RunRow {
    pub id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub status: String,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for PipelineRun {
    type Error = DbError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<RunStatus>()
            .map_err(|e| DbError::InvalidData(e.to_string()))?;

        Ok(PipelineRun {
            id: row.id.into(),
            job_id: row.job_id.into(),
            status,
            output: row.output,
            error: row.error,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

fn rows_to_runs(rows: Vec<RunRow>) -> DbResult<Vec<PipelineRun>> {
    rows.into_iter().map(PipelineRun::try_from).collect()
}

#[async_trait]
pub trait RunRepo: Send + Sync {
    /// Start a run for a job in `running` state.
    async fn create_run(&self, job_id: ResourceId) -> DbResult<PipelineRun>;

    /// Record the outcome of a run. A run can only be finished once.
    async fn finish_run(&self, id: ResourceId, outcome: &RunOutcome) -> DbResult<PipelineRun>;

    /// A page of runs across all jobs, most recent first, plus the total.
    async fn pipeline_runs(&self, offset: i64, limit: i64) -> DbResult<(Vec<PipelineRun>, i64)>;

    /// A page of one job's runs, most recent first, plus the job's total.
    async fn pipeline_runs_by_job_id(
        &self,
        job_id: ResourceId,
        offset: i64,
        limit: i64,
    ) -> DbResult<(Vec<PipelineRun>, i64)>;
}

/// Reject outcomes that would leave a run unfinished.
pub(crate) fn check_outcome(outcome: &RunOutcome) -> DbResult<()> {
    if !outcome.status.is_terminal() {
        return Err(DbError::Validation(
            "a run can only be finished with a terminal status".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl RunRepo for PgJobOrm {
    async fn create_run(&self, job_id: ResourceId) -> DbResult<PipelineRun> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            INSERT INTO pipeline_runs (id, job_id, status, created_at)
            VALUES ($1, $2, 'running', NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(job_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::NotFound(_) => DbError::NotFound(format!("job {}", job_id)),
            other => other,
        })?;
        row.try_into()
    }

    async fn finish_run(&self, id: ResourceId, outcome: &RunOutcome) -> DbResult<PipelineRun> {
        check_outcome(outcome)?;

        let mut tx = self.pool.begin().await?;

        let finished = sqlx::query_as::<_, RunRow>(
            r#"
            UPDATE pipeline_runs
            SET status = $2, output = $3, error = $4, finished_at = NOW()
            WHERE id = $1 AND finished_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(outcome.status.as_str())
        .bind(&outcome.output)
        .bind(&outcome.error)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match finished {
            Some(row) => row,
            None => {
                let exists: Option<(uuid::Uuid,)> =
                    sqlx::query_as("SELECT id FROM pipeline_runs WHERE id = $1")
                        .bind(id.as_uuid())
                        .fetch_optional(&mut *tx)
                        .await?;
                return Err(match exists {
                    Some(_) => DbError::Duplicate(format!("pipeline run {} already finished", id)),
                    None => DbError::NotFound(format!("pipeline run {}", id)),
                });
            }
        };

        tx.commit().await?;
        row.try_into()
    }

    async fn pipeline_runs(&self, offset: i64, limit: i64) -> DbResult<(Vec<PipelineRun>, i64)> {
        check_page(offset, limit)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pipeline_runs")
            .fetch_one(&mut *tx)
            .await?;

        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM pipeline_runs
            ORDER BY created_at DESC, id DESC
            OFFSET $1 LIMIT $2
            "#,
        )
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((rows_to_runs(rows)?, total.0))
    }

    async fn pipeline_runs_by_job_id(
        &self,
        job_id: ResourceId,
        offset: i64,
        limit: i64,
    ) -> DbResult<(Vec<PipelineRun>, i64)> {
        check_page(offset, limit)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pipeline_runs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_one(&mut *tx)
            .await?;

        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM pipeline_runs
            WHERE job_id = $1
            ORDER BY created_at DESC, id DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((rows_to_runs(rows)?, total.0))
    }
}
