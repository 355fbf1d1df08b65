//! Per-node claim coordination.
//!
//! The store decides who owns a job; the coordinator tracks which of those
//! jobs this node is running, starts a run for each newly claimed job and
//! tears local work down when a job is deleted, released or lost.

use jobmesh_core::{InstanceId, Job, ResourceId};
use jobmesh_db::{ClaimRepo, DbError, JobOrm, with_deadline};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SchedulerResult;
use crate::runner::JobRunner;

/// Local state for a job this node holds.
struct HeldJob {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeldJob {
    fn stop(mut self) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        self.task.take()
    }
}

pub struct ClaimCoordinator {
    store: Arc<dyn JobOrm>,
    instance: InstanceId,
    runner: Option<Arc<JobRunner>>,
    deadline: Duration,
    shutdown: CancellationToken,
    held: Mutex<HashMap<ResourceId, HeldJob>>,
    /// Serializes claim passes with heartbeats, so a heartbeat never sees a
    /// job claimed after its renewal as lost.
    claiming: Mutex<()>,
}

impl ClaimCoordinator {
    pub fn new(
        store: Arc<dyn JobOrm>,
        instance: InstanceId,
        deadline: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            instance,
            runner: None,
            deadline,
            shutdown,
            held: Mutex::new(HashMap::new()),
            claiming: Mutex::new(()),
        }
    }

    /// Run each newly claimed job through `runner`.
    pub fn with_runner(mut self, runner: Arc<JobRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    /// Claim every available job and start work for the ones not already
    /// held. Returns the newly held ids.
    pub async fn claim_unclaimed_jobs(&self) -> SchedulerResult<Vec<ResourceId>> {
        let _claiming = self.claiming.lock().await;
        let jobs = with_deadline(
            self.deadline,
            self.store.claim_unclaimed_jobs(&self.instance),
        )
        .await?;

        let mut held = self.held.lock().await;
        let mut started = Vec::new();
        for job in jobs {
            if held.contains_key(&job.id) {
                continue;
            }
            let id = job.id;
            held.insert(id, self.start(job));
            started.push(id);
        }
        Ok(started)
    }

    fn start(&self, job: Job) -> HeldJob {
        let cancel = self.shutdown.child_token();
        let task = self.runner.clone().map(|runner| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = runner.run(&job, cancel).await {
                    warn!(job_id = %job.id, error = %e, "Run failed");
                }
            })
        });
        HeldJob { cancel, task }
    }

    /// Release a job. Local work stops and its run is finished before the
    /// store claim is dropped. A job held by another instance or already
    /// gone is not an error here.
    pub async fn unclaim_job(&self, id: ResourceId) -> SchedulerResult<()> {
        self.teardown(id).await;

        match with_deadline(self.deadline, self.store.unclaim_job(&self.instance, id)).await {
            Ok(()) => {
                debug!(job_id = %id, "Released claim");
                Ok(())
            }
            Err(DbError::Ownership { owner, .. }) => {
                warn!(job_id = %id, instance_id = %self.instance, owner = %owner, "Tried to unclaim a job held by another instance");
                Ok(())
            }
            Err(DbError::NotFound(_)) => {
                debug!(job_id = %id, "Job already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew every lease this node holds. Jobs the store no longer
    /// attributes to this node are torn down and returned.
    pub async fn heartbeat(&self) -> SchedulerResult<Vec<ResourceId>> {
        let candidates: Vec<ResourceId> = {
            let _claiming = self.claiming.lock().await;
            let held_before: Vec<ResourceId> = self.held.lock().await.keys().copied().collect();
            let renewed =
                with_deadline(self.deadline, self.store.heartbeat(&self.instance)).await?;
            held_before
                .into_iter()
                .filter(|id| !renewed.contains(id))
                .collect()
        };

        let mut lost = Vec::with_capacity(candidates.len());
        for id in candidates {
            if self.teardown(id).await {
                warn!(job_id = %id, instance_id = %self.instance, "Lost claim, stopped job");
                lost.push(id);
            }
        }
        lost.sort();
        Ok(lost)
    }

    /// Stop local work for a job and wait for its run to finish. Returns
    /// whether anything was held.
    pub async fn teardown(&self, id: ResourceId) -> bool {
        let removed = self.held.lock().await.remove(&id);
        let Some(job) = removed else {
            return false;
        };
        if let Some(task) = job.stop() {
            if let Err(e) = task.await {
                warn!(job_id = %id, error = %e, "Run task panicked");
            }
        }
        info!(job_id = %id, "Stopped job");
        true
    }

    pub async fn claimed_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.held.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn is_held(&self, id: ResourceId) -> bool {
        self.held.lock().await.contains_key(&id)
    }

    /// Heartbeat every `interval` until `cancel` fires.
    pub async fn run_heartbeat(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(instance_id = %self.instance, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
        debug!("Heartbeat stopped");
    }

    /// Stop every held job, wait for their runs to end, then release their
    /// claims.
    pub async fn release_all(&self) {
        let held: Vec<(ResourceId, HeldJob)> = self.held.lock().await.drain().collect();

        let mut ids = Vec::with_capacity(held.len());
        for (id, job) in held {
            if let Some(task) = job.stop() {
                if let Err(e) = task.await {
                    warn!(job_id = %id, error = %e, "Run task panicked");
                }
            }
            ids.push(id);
        }

        for id in ids {
            if let Err(e) = self.unclaim_job(id).await {
                warn!(job_id = %id, error = %e, "Failed to release claim");
            }
        }
    }
}
