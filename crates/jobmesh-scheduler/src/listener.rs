//! Reacts to job change notifications.
//!
//! A created job triggers a claim attempt; a deleted job triggers local
//! teardown. Notifications only shorten latency, so a lost subscription is
//! re-opened with backoff and anything missed in between is left to the
//! reconciliation scanner.

use jobmesh_core::ResourceId;
use jobmesh_db::{Backoff, JobNotifier, JobOrm, Subscription};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SchedulerResult;
use crate::coordinator::ClaimCoordinator;

/// Which notification stream a listener follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Deleted,
}

impl ChangeKind {
    fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Deleted => "deleted",
        }
    }
}

pub struct ChangeListener {
    store: Arc<dyn JobOrm>,
    coordinator: Arc<ClaimCoordinator>,
}

impl ChangeListener {
    pub fn new(store: Arc<dyn JobOrm>, coordinator: Arc<ClaimCoordinator>) -> Self {
        Self { store, coordinator }
    }

    async fn subscribe(&self, kind: ChangeKind) -> SchedulerResult<Subscription> {
        let subscription = match kind {
            ChangeKind::Created => self.store.listen_for_new_jobs().await?,
            ChangeKind::Deleted => self.store.listen_for_deleted_jobs().await?,
        };
        Ok(subscription)
    }

    /// Follow one notification stream until `cancel` fires.
    pub async fn run(&self, kind: ChangeKind, cancel: CancellationToken) {
        let mut backoff = Backoff::new();

        while !cancel.is_cancelled() {
            let mut subscription = match self.subscribe(kind).await {
                Ok(subscription) => {
                    info!(change = kind.as_str(), "Listening for job changes");
                    backoff.reset();
                    subscription
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(change = kind.as_str(), error = %e, retry_in = ?delay, "Failed to subscribe to job changes");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = subscription.recv() => next,
                };
                match next {
                    Some(id) => self.handle(kind, id).await,
                    None if cancel.is_cancelled() => break,
                    None => {
                        warn!(change = kind.as_str(), "Job change subscription ended, resubscribing");
                        break;
                    }
                }
            }
            subscription.close();
        }

        debug!(change = kind.as_str(), "Change listener stopped");
    }

    async fn handle(&self, kind: ChangeKind, id: ResourceId) {
        match kind {
            ChangeKind::Created => {
                debug!(job_id = %id, "Job created, attempting claim");
                if let Err(e) = self.coordinator.claim_unclaimed_jobs().await {
                    warn!(job_id = %id, error = %e, "Claim after job creation failed");
                }
            }
            ChangeKind::Deleted => {
                if self.coordinator.teardown(id).await {
                    info!(job_id = %id, "Job deleted, stopped local work");
                }
            }
        }
    }
}
