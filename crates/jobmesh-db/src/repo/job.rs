//! Job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobmesh_core::{Claim, InstanceId, Job, JobType, NewJob, PipelineSpec, ResourceId};
use sqlx::PgConnection;
use sqlx::types::Json;
use tracing::info;

use super::{PgJobOrm, check_page};
use crate::{DbError, DbResult};

/// Columns selected for every job query. Callers alias the jobs table as
/// `j` and the pipeline specs table as `p`.
pub(crate) const JOB_COLUMNS: &str = r#"
    j.id, j.name, j.job_type, j.pipeline_spec_id, p.spec AS pipeline_spec,
    j.claimed_by, j.claimed_at, j.created_at
"#;

/// Database row for jobs joined with their pipeline spec.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: uuid::Uuid,
    pub name: String,
    pub job_type: String,
    pub pipeline_spec_id: uuid::Uuid,
    pub pipeline_spec: Json<PipelineSpec>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let job_type = row
            .job_type
            .parse::<JobType>()
            .map_err(|_| DbError::InvalidData(format!("unknown job type: {}", row.job_type)))?;

        let claim = match (row.claimed_by, row.claimed_at) {
            (Some(owner), Some(at)) => Some(Claim {
                claimed_by: InstanceId::new(owner),
                claimed_at: at,
            }),
            (None, None) => None,
            _ => {
                return Err(DbError::InvalidData(format!(
                    "job {} has a partial claim",
                    row.id
                )));
            }
        };

        Ok(Job {
            id: row.id.into(),
            name: row.name,
            job_type,
            pipeline_spec_id: row.pipeline_spec_id.into(),
            pipeline_spec: row.pipeline_spec.0,
            claim,
            created_at: row.created_at,
        })
    }
}

pub(crate) fn rows_to_jobs(rows: Vec<JobRow>) -> DbResult<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Store a job and its pipeline spec atomically.
    async fn create_job(&self, job: NewJob) -> DbResult<Job>;

    async fn find_job(&self, id: ResourceId) -> DbResult<Job>;

    /// Delete a job. Fails with `NotFound` if it is already gone.
    async fn delete_job(&self, id: ResourceId) -> DbResult<()>;

    /// A page of jobs in creation order, plus the total number of jobs.
    async fn jobs_v2(&self, offset: i64, limit: i64) -> DbResult<(Vec<Job>, i64)>;

    /// Ids of every job whose pipeline references the named bridge.
    async fn find_job_ids_with_bridge(&self, name: &str) -> DbResult<Vec<ResourceId>>;

    /// The subset of `ids` that no longer exist in the store.
    async fn check_for_deleted_jobs(&self, ids: &[ResourceId]) -> DbResult<Vec<ResourceId>>;
}

impl PgJobOrm {
    /// Same as `find_job`, but on a connection or transaction owned by the
    /// caller.
    pub async fn find_job_tx(conn: &mut PgConnection, id: ResourceId) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs j JOIN pipeline_specs p ON p.id = j.pipeline_spec_id WHERE j.id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        row.try_into()
    }
}

#[async_trait]
impl JobRepo for PgJobOrm {
    async fn create_job(&self, job: NewJob) -> DbResult<Job> {
        job.validate()?;

        let mut tx = self.pool.begin().await?;

        let spec_id = uuid::Uuid::now_v7();
        sqlx::query("INSERT INTO pipeline_specs (id, spec, created_at) VALUES ($1, $2, NOW())")
            .bind(spec_id)
            .bind(Json(&job.pipeline_spec))
            .execute(&mut *tx)
            .await?;

        let job_id = uuid::Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, name, job_type, pipeline_spec_id, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(job_id)
        .bind(&job.name)
        .bind(job.job_type.as_str())
        .bind(spec_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::Duplicate(_) => DbError::Duplicate(format!("job named '{}'", job.name)),
            other => other,
        })?;

        let created = Self::find_job_tx(&mut *tx, job_id.into()).await?;
        tx.commit().await?;

        info!(job_id = %created.id, name = %created.name, "Created job");
        Ok(created)
    }

    async fn find_job(&self, id: ResourceId) -> DbResult<Job> {
        let mut conn = self.pool.acquire().await?;
        Self::find_job_tx(&mut *conn, id).await
    }

    async fn delete_job(&self, id: ResourceId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let spec_id: (uuid::Uuid,) =
            sqlx::query_as("DELETE FROM jobs WHERE id = $1 RETURNING pipeline_spec_id")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;

        sqlx::query("DELETE FROM pipeline_specs WHERE id = $1")
            .bind(spec_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(job_id = %id, "Deleted job");
        Ok(())
    }

    async fn jobs_v2(&self, offset: i64, limit: i64) -> DbResult<(Vec<Job>, i64)> {
        check_page(offset, limit)?;

        // Count and page under one snapshot so total matches the page.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&mut *tx)
            .await?;

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs j JOIN pipeline_specs p ON p.id = j.pipeline_spec_id
            ORDER BY j.created_at ASC, j.id ASC
            OFFSET $1 LIMIT $2
            "#
        ))
        .bind(offset)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((rows_to_jobs(rows)?, total.0))
    }

    async fn find_job_ids_with_bridge(&self, name: &str) -> DbResult<Vec<ResourceId>> {
        let ids: Vec<(uuid::Uuid,)> = sqlx::query_as(
            r#"
            SELECT j.id
            FROM jobs j JOIN pipeline_specs p ON p.id = j.pipeline_spec_id
            WHERE EXISTS (
                SELECT 1 FROM jsonb_array_elements(p.spec -> 'tasks') AS t(task)
                WHERE t.task -> 'kind' ->> 'type' = 'bridge'
                  AND t.task -> 'kind' ->> 'name' = $1
            )
            ORDER BY j.id
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id.into()).collect())
    }

    async fn check_for_deleted_jobs(&self, ids: &[ResourceId]) -> DbResult<Vec<ResourceId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let missing: Vec<(uuid::Uuid,)> = sqlx::query_as(
            r#"
            SELECT t.id
            FROM unnest($1::uuid[]) AS t(id)
            WHERE NOT EXISTS (SELECT 1 FROM jobs j WHERE j.id = t.id)
            ORDER BY t.id
            "#,
        )
        .bind(uuids)
        .fetch_all(&self.pool)
        .await?;
        Ok(missing.into_iter().map(|(id,)| id.into()).collect())
    }
}
