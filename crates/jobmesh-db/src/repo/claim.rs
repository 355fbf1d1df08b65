//! Claim repository.
//!
//! Claims are leases on job rows. Every write to `claimed_by` is a
//! conditional update, so concurrent nodes can never both own a job.

use async_trait::async_trait;
use jobmesh_core::{InstanceId, Job, ResourceId};
use tracing::{debug, info};

use super::PgJobOrm;
use super::job::{JOB_COLUMNS, JobRow, rows_to_jobs};
use crate::{DbError, DbResult};

#[async_trait]
pub trait ClaimRepo: Send + Sync {
    /// Claim every job that is unclaimed or whose lease expired. A job is
    /// returned to at most one concurrent caller; losing a race is not an
    /// error.
    async fn claim_unclaimed_jobs(&self, instance: &InstanceId) -> DbResult<Vec<Job>>;

    /// Release a claim. Succeeds if the job is already unclaimed; fails with
    /// `Ownership` if another instance holds it and `NotFound` if the job is
    /// gone.
    async fn unclaim_job(&self, instance: &InstanceId, id: ResourceId) -> DbResult<()>;

    /// Renew every claim held by `instance`, returning the ids still held.
    async fn heartbeat(&self, instance: &InstanceId) -> DbResult<Vec<ResourceId>>;
}

#[async_trait]
impl ClaimRepo for PgJobOrm {
    async fn claim_unclaimed_jobs(&self, instance: &InstanceId) -> DbResult<Vec<Job>> {
        // SKIP LOCKED keeps racing claimers off each other's rows; the
        // outer UPDATE re-checks the lease condition on the locked rows.
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            WITH claimed AS (
                UPDATE jobs
                SET claimed_by = $1, claimed_at = NOW()
                WHERE id IN (
                    SELECT id FROM jobs
                    WHERE claimed_by IS NULL
                       OR claimed_at < NOW() - make_interval(secs => $2::float8)
                    ORDER BY created_at ASC, id ASC
                    FOR UPDATE SKIP LOCKED
                )
                AND (claimed_by IS NULL OR claimed_at < NOW() - make_interval(secs => $2::float8))
                RETURNING *
            )
            SELECT {JOB_COLUMNS}
            FROM claimed j JOIN pipeline_specs p ON p.id = j.pipeline_spec_id
            ORDER BY j.created_at ASC, j.id ASC
            "#
        ))
        .bind(instance.as_str())
        .bind(self.lease_ttl.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let jobs = rows_to_jobs(rows)?;
        if !jobs.is_empty() {
            info!(instance_id = %instance, count = jobs.len(), "Claimed jobs");
        }
        Ok(jobs)
    }

    async fn unclaim_job(&self, instance: &InstanceId, id: ResourceId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let owner: (Option<String>,) =
            sqlx::query_as("SELECT claimed_by FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;

        match owner.0 {
            None => {
                debug!(job_id = %id, "Job already unclaimed");
            }
            Some(owner) if owner == instance.as_str() => {
                sqlx::query(
                    "UPDATE jobs SET claimed_by = NULL, claimed_at = NULL WHERE id = $1 AND claimed_by = $2",
                )
                .bind(id.as_uuid())
                .bind(instance.as_str())
                .execute(&mut *tx)
                .await?;
                debug!(job_id = %id, instance_id = %instance, "Unclaimed job");
            }
            Some(owner) => {
                return Err(DbError::Ownership {
                    job: id.to_string(),
                    owner,
                });
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn heartbeat(&self, instance: &InstanceId) -> DbResult<Vec<ResourceId>> {
        let ids: Vec<(uuid::Uuid,)> = sqlx::query_as(
            "UPDATE jobs SET claimed_at = NOW() WHERE claimed_by = $1 RETURNING id",
        )
        .bind(instance.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id.into()).collect())
    }
}

/// Integration tests that require PostgreSQL.
/// Run with: DATABASE_URL=postgres://... cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::repo::JobRepo;
    use crate::test_support::{pg_orm, sample_job};
    use std::collections::HashSet;

    #[tokio::test]
    #[ignore]
    async fn test_concurrent_claims_never_overlap() {
        let orm = pg_orm().await;
        for i in 0..20 {
            orm.create_job(sample_job(&format!("overlap-{}-{}", i, uuid::Uuid::new_v4())))
                .await
                .unwrap();
        }

        let a = InstanceId::generate();
        let b = InstanceId::generate();
        let (left, right) = tokio::join!(orm.claim_unclaimed_jobs(&a), orm.claim_unclaimed_jobs(&b));

        let left: HashSet<_> = left.unwrap().into_iter().map(|j| j.id).collect();
        let right: HashSet<_> = right.unwrap().into_iter().map(|j| j.id).collect();
        assert!(left.is_disjoint(&right));
    }

    #[tokio::test]
    #[ignore]
    async fn test_unclaim_by_other_instance_is_ownership_error() {
        let orm = pg_orm().await;
        let job = orm
            .create_job(sample_job(&format!("owned-{}", uuid::Uuid::new_v4())))
            .await
            .unwrap();
        let a = InstanceId::generate();
        let claimed = orm.claim_unclaimed_jobs(&a).await.unwrap();
        assert!(claimed.iter().any(|j| j.id == job.id));

        let err = orm
            .unclaim_job(&InstanceId::generate(), job.id)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Ownership { .. }));

        orm.unclaim_job(&a, job.id).await.unwrap();
        orm.unclaim_job(&a, job.id).await.unwrap();
        orm.delete_job(job.id).await.unwrap();
    }
}
