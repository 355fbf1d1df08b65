//! In-process job store.
//!
//! Implements the same contracts as `PgJobOrm` behind a single mutex. Used
//! by tests and by `jobmesh node --in-memory`. The clock can be advanced to
//! expire leases, and notifications can be switched off to simulate a lost
//! listener connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobmesh_core::evaluator::RunOutcome;
use jobmesh_core::{
    Claim, InstanceId, Job, JobError, NewJob, PipelineRun, ResourceId, RunStatus,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::repo::run::check_outcome;
use crate::repo::{
    ClaimRepo, DEFAULT_LEASE_TTL, JobErrorRepo, JobNotifier, JobOrm, JobRepo, LogLevelRepo,
    RunRepo, check_page,
};
use crate::subscription::{
    DELETED_JOBS_CHANNEL, NEW_JOBS_CHANNEL, SUBSCRIPTION_BUFFER, Subscription,
};
use crate::{DbError, DbResult};

#[derive(Default)]
struct State {
    /// Jobs in creation order.
    jobs: Vec<Job>,
    /// Runs in creation order.
    runs: Vec<PipelineRun>,
    errors: Vec<JobError>,
    log_levels: HashMap<String, String>,
    new_job_subscribers: Vec<mpsc::Sender<ResourceId>>,
    deleted_job_subscribers: Vec<mpsc::Sender<ResourceId>>,
    clock_offset: Duration,
    notifications_disabled: bool,
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        chrono::Duration::from_std(self.clock_offset)
            .ok()
            .and_then(|offset| now.checked_add_signed(offset))
            .unwrap_or(now)
    }

    fn job_index(&self, id: ResourceId) -> DbResult<usize> {
        self.jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    fn publish(&mut self, channel: &'static str, id: ResourceId) {
        if self.notifications_disabled {
            debug!(channel, job_id = %id, "Notifications disabled, dropping");
            return;
        }
        let subscribers = if channel == NEW_JOBS_CHANNEL {
            &mut self.new_job_subscribers
        } else {
            &mut self.deleted_job_subscribers
        };
        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            if tx.try_send(id).is_err() {
                warn!(channel, job_id = %id, "Subscriber buffer full, dropping notification");
            }
        }
    }
}

/// In-process implementation of every store trait.
pub struct MemoryJobOrm {
    state: Mutex<State>,
    lease_ttl: Duration,
    shutdown: CancellationToken,
}

impl MemoryJobOrm {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            lease_ttl: DEFAULT_LEASE_TTL,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Move the store's clock forward. Only claim leases observe it.
    pub async fn advance_clock(&self, by: Duration) {
        self.state.lock().await.clock_offset += by;
    }

    /// Stop or resume publishing change notifications.
    pub async fn set_notifications_enabled(&self, enabled: bool) {
        self.state.lock().await.notifications_disabled = !enabled;
    }

    pub async fn set_service_log_level(&self, service: &str, level: &str) {
        self.state
            .lock()
            .await
            .log_levels
            .insert(service.to_string(), level.to_string());
    }

    /// Every stored job in creation order. Readable after `close`.
    pub async fn jobs_snapshot(&self) -> Vec<Job> {
        self.state.lock().await.jobs.clone()
    }

    async fn open(&self) -> DbResult<MutexGuard<'_, State>> {
        if self.shutdown.is_cancelled() {
            return Err(DbError::Transient("job store is closed".to_string()));
        }
        Ok(self.state.lock().await)
    }

    fn lease_expired(&self, claim: &Claim, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(self.lease_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .is_some_and(|cutoff| claim.claimed_at < cutoff)
    }

    async fn subscribe(&self, channel: &'static str) -> DbResult<Subscription> {
        let mut state = self.open().await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        if channel == NEW_JOBS_CHANNEL {
            state.new_job_subscribers.push(tx);
        } else {
            state.deleted_job_subscribers.push(tx);
        }
        Ok(Subscription::new(
            channel,
            rx,
            self.shutdown.child_token(),
            None,
        ))
    }
}

impl Default for MemoryJobOrm {
    fn default() -> Self {
        Self::new()
    }
}

fn page<T: Clone>(items: impl Iterator<Item = T>, offset: i64, limit: i64) -> Vec<T> {
    items
        .skip(usize::try_from(offset).unwrap_or(usize::MAX))
        .take(usize::try_from(limit).unwrap_or(usize::MAX))
        .collect()
}

fn total(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobRepo for MemoryJobOrm {
    async fn create_job(&self, job: NewJob) -> DbResult<Job> {
        job.validate()?;

        let mut state = self.open().await?;
        if state.jobs.iter().any(|j| j.name == job.name) {
            return Err(DbError::Duplicate(format!("job named '{}'", job.name)));
        }

        let created = Job {
            id: ResourceId::new(),
            name: job.name,
            job_type: job.job_type,
            pipeline_spec_id: ResourceId::new(),
            pipeline_spec: job.pipeline_spec,
            claim: None,
            created_at: state.now(),
        };
        state.jobs.push(created.clone());
        state.publish(NEW_JOBS_CHANNEL, created.id);

        info!(job_id = %created.id, name = %created.name, "Created job");
        Ok(created)
    }

    async fn find_job(&self, id: ResourceId) -> DbResult<Job> {
        let state = self.open().await?;
        let index = state.job_index(id)?;
        Ok(state.jobs[index].clone())
    }

    async fn delete_job(&self, id: ResourceId) -> DbResult<()> {
        let mut state = self.open().await?;
        let index = state.job_index(id)?;
        state.jobs.remove(index);
        state.runs.retain(|r| r.job_id != id);
        state.errors.retain(|e| e.job_id != id);
        state.publish(DELETED_JOBS_CHANNEL, id);

        info!(job_id = %id, "Deleted job");
        Ok(())
    }

    async fn jobs_v2(&self, offset: i64, limit: i64) -> DbResult<(Vec<Job>, i64)> {
        check_page(offset, limit)?;
        let state = self.open().await?;
        let jobs = page(state.jobs.iter().cloned(), offset, limit);
        Ok((jobs, total(state.jobs.len())))
    }

    async fn find_job_ids_with_bridge(&self, name: &str) -> DbResult<Vec<ResourceId>> {
        let state = self.open().await?;
        let mut ids: Vec<ResourceId> = state
            .jobs
            .iter()
            .filter(|j| j.pipeline_spec.references_bridge(name))
            .map(|j| j.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn check_for_deleted_jobs(&self, ids: &[ResourceId]) -> DbResult<Vec<ResourceId>> {
        let state = self.open().await?;
        let mut missing: Vec<ResourceId> = ids
            .iter()
            .copied()
            .filter(|id| !state.jobs.iter().any(|j| j.id == *id))
            .collect();
        missing.sort();
        missing.dedup();
        Ok(missing)
    }
}

#[async_trait]
impl ClaimRepo for MemoryJobOrm {
    async fn claim_unclaimed_jobs(&self, instance: &InstanceId) -> DbResult<Vec<Job>> {
        let mut state = self.open().await?;
        let now = state.now();

        let mut claimed = Vec::new();
        for job in state.jobs.iter_mut() {
            let available = match &job.claim {
                None => true,
                Some(claim) => self.lease_expired(claim, now),
            };
            if available {
                job.claim = Some(Claim {
                    claimed_by: instance.clone(),
                    claimed_at: now,
                });
                claimed.push(job.clone());
            }
        }

        if !claimed.is_empty() {
            info!(instance_id = %instance, count = claimed.len(), "Claimed jobs");
        }
        Ok(claimed)
    }

    async fn unclaim_job(&self, instance: &InstanceId, id: ResourceId) -> DbResult<()> {
        let mut state = self.open().await?;
        let index = state.job_index(id)?;
        let job = &mut state.jobs[index];

        match &job.claim {
            None => {
                debug!(job_id = %id, "Job already unclaimed");
            }
            Some(claim) if &claim.claimed_by == instance => {
                job.claim = None;
                debug!(job_id = %id, instance_id = %instance, "Unclaimed job");
            }
            Some(claim) => {
                return Err(DbError::Ownership {
                    job: id.to_string(),
                    owner: claim.claimed_by.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn heartbeat(&self, instance: &InstanceId) -> DbResult<Vec<ResourceId>> {
        let mut state = self.open().await?;
        let now = state.now();
        Ok(state
            .jobs
            .iter_mut()
            .filter(|j| j.is_claimed_by(instance))
            .map(|j| {
                j.claim = Some(Claim {
                    claimed_by: instance.clone(),
                    claimed_at: now,
                });
                j.id
            })
            .collect())
    }
}

#[async_trait]
impl RunRepo for MemoryJobOrm {
    async fn create_run(&self, job_id: ResourceId) -> DbResult<PipelineRun> {
        let mut state = self.open().await?;
        state.job_index(job_id)?;

        let run = PipelineRun {
            id: ResourceId::new(),
            job_id,
            status: RunStatus::Running,
            output: None,
            error: None,
            created_at: state.now(),
            finished_at: None,
        };
        state.runs.push(run.clone());
        Ok(run)
    }

    async fn finish_run(&self, id: ResourceId, outcome: &RunOutcome) -> DbResult<PipelineRun> {
        check_outcome(outcome)?;

        let mut state = self.open().await?;
        let now = state.now();
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DbError::NotFound(format!("pipeline run {}", id)))?;
        if run.finished_at.is_some() {
            return Err(DbError::Duplicate(format!(
                "pipeline run {} already finished",
                id
            )));
        }

        run.status = outcome.status;
        run.output = outcome.output.clone();
        run.error = outcome.error.clone();
        run.finished_at = Some(now);
        Ok(run.clone())
    }

    async fn pipeline_runs(&self, offset: i64, limit: i64) -> DbResult<(Vec<PipelineRun>, i64)> {
        check_page(offset, limit)?;
        let state = self.open().await?;
        let runs = page(state.runs.iter().rev().cloned(), offset, limit);
        Ok((runs, total(state.runs.len())))
    }

    async fn pipeline_runs_by_job_id(
        &self,
        job_id: ResourceId,
        offset: i64,
        limit: i64,
    ) -> DbResult<(Vec<PipelineRun>, i64)> {
        check_page(offset, limit)?;
        let state = self.open().await?;
        let count = state.runs.iter().filter(|r| r.job_id == job_id).count();
        let runs = page(
            state.runs.iter().rev().filter(|r| r.job_id == job_id).cloned(),
            offset,
            limit,
        );
        Ok((runs, total(count)))
    }
}

#[async_trait]
impl JobErrorRepo for MemoryJobOrm {
    async fn record_error(&self, job_id: ResourceId, description: &str) -> DbResult<JobError> {
        let mut state = self.open().await?;
        state.job_index(job_id)?;
        let now = state.now();

        if let Some(existing) = state.errors.iter_mut().find(|e| {
            e.job_id == job_id && e.description == description && e.dismissed_at.is_none()
        }) {
            existing.occurrences += 1;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let error = JobError {
            id: ResourceId::new(),
            job_id,
            description: description.to_string(),
            occurrences: 1,
            created_at: now,
            updated_at: now,
            dismissed_at: None,
        };
        state.errors.push(error.clone());
        Ok(error)
    }

    async fn dismiss_error(&self, id: ResourceId) -> DbResult<()> {
        let mut state = self.open().await?;
        let now = state.now();
        let error = state
            .errors
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| DbError::NotFound(format!("job error {}", id)))?;
        error.dismissed_at.get_or_insert(now);
        Ok(())
    }

    async fn job_errors(&self, job_id: ResourceId) -> DbResult<Vec<JobError>> {
        let state = self.open().await?;
        let mut errors: Vec<JobError> = state
            .errors
            .iter()
            .filter(|e| e.job_id == job_id && !e.is_dismissed())
            .cloned()
            .collect();
        errors.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(errors)
    }
}

#[async_trait]
impl JobNotifier for MemoryJobOrm {
    async fn listen_for_new_jobs(&self) -> DbResult<Subscription> {
        self.subscribe(NEW_JOBS_CHANNEL).await
    }

    async fn listen_for_deleted_jobs(&self) -> DbResult<Subscription> {
        self.subscribe(DELETED_JOBS_CHANNEL).await
    }
}

#[async_trait]
impl LogLevelRepo for MemoryJobOrm {
    async fn service_log_level(&self, service: &str) -> DbResult<Option<String>> {
        let state = self.open().await?;
        Ok(state.log_levels.get(service).cloned())
    }
}

#[async_trait]
impl JobOrm for MemoryJobOrm {
    async fn close(&self) -> DbResult<()> {
        self.shutdown.cancel();
        let mut state = self.state.lock().await;
        state.new_job_subscribers.clear();
        state.deleted_job_subscribers.clear();
        info!("Job store closed");
        Ok(())
    }
}
