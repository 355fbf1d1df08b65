//! Periodic fallback for missed notifications.

use jobmesh_core::ResourceId;
use jobmesh_db::{JobOrm, JobRepo, with_deadline};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SchedulerResult;
use crate::coordinator::ClaimCoordinator;

/// What one reconciliation pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Held jobs found deleted and torn down.
    pub deleted: Vec<ResourceId>,
    /// Jobs newly claimed.
    pub claimed: Vec<ResourceId>,
}

pub struct ReconciliationScanner {
    store: Arc<dyn JobOrm>,
    coordinator: Arc<ClaimCoordinator>,
    interval: Duration,
    deadline: Duration,
}

impl ReconciliationScanner {
    pub fn new(
        store: Arc<dyn JobOrm>,
        coordinator: Arc<ClaimCoordinator>,
        interval: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            coordinator,
            interval,
            deadline,
        }
    }

    /// Tear down held jobs that no longer exist, then claim whatever is
    /// available.
    pub async fn reconcile(&self) -> SchedulerResult<Reconciliation> {
        let held = self.coordinator.claimed_ids().await;
        let deleted =
            with_deadline(self.deadline, self.store.check_for_deleted_jobs(&held)).await?;
        for id in &deleted {
            if self.coordinator.teardown(*id).await {
                info!(job_id = %id, "Reconciliation found deleted job");
            }
        }

        let claimed = self.coordinator.claim_unclaimed_jobs().await?;
        if !claimed.is_empty() {
            info!(count = claimed.len(), "Reconciliation claimed jobs");
        }

        Ok(Reconciliation { deleted, claimed })
    }

    /// Reconcile every interval until `cancel` fires. Failures are retried
    /// on the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, retryable = e.is_retryable(), "Reconciliation failed");
                    }
                }
            }
        }
        debug!("Reconciliation scanner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_job;
    use jobmesh_core::InstanceId;
    use jobmesh_db::{ClaimRepo, MemoryJobOrm};

    const DEADLINE: Duration = Duration::from_secs(5);

    fn setup(store: &Arc<MemoryJobOrm>) -> (Arc<ClaimCoordinator>, ReconciliationScanner) {
        let coordinator = Arc::new(ClaimCoordinator::new(
            store.clone(),
            InstanceId::new("node-a"),
            DEADLINE,
            CancellationToken::new(),
        ));
        let scanner = ReconciliationScanner::new(
            store.clone(),
            coordinator.clone(),
            Duration::from_secs(60),
            DEADLINE,
        );
        (coordinator, scanner)
    }

    #[tokio::test]
    async fn test_missed_deletion_is_reconciled() {
        let store = Arc::new(MemoryJobOrm::new());
        let kept = store.create_job(sample_job("kept")).await.unwrap();
        let gone = store.create_job(sample_job("gone")).await.unwrap();
        let (coordinator, scanner) = setup(&store);
        coordinator.claim_unclaimed_jobs().await.unwrap();

        store.set_notifications_enabled(false).await;
        store.delete_job(gone.id).await.unwrap();

        let pass = scanner.reconcile().await.unwrap();
        assert_eq!(pass.deleted, vec![gone.id]);
        assert!(pass.claimed.is_empty());
        assert_eq!(coordinator.claimed_ids().await, vec![kept.id]);
    }

    #[tokio::test]
    async fn test_missed_creation_is_reconciled() {
        let store = Arc::new(MemoryJobOrm::new());
        let (coordinator, scanner) = setup(&store);

        store.set_notifications_enabled(false).await;
        let job = store.create_job(sample_job("quiet")).await.unwrap();

        let pass = scanner.reconcile().await.unwrap();
        assert_eq!(pass.claimed, vec![job.id]);
        assert!(coordinator.is_held(job.id).await);

        // Nothing left to do on the next pass.
        assert_eq!(scanner.reconcile().await.unwrap(), Reconciliation::default());
    }

    #[tokio::test]
    async fn test_expired_lease_is_picked_up() {
        let store = Arc::new(MemoryJobOrm::new().with_lease_ttl(Duration::from_secs(30)));
        let job = store.create_job(sample_job("orphan")).await.unwrap();
        store
            .claim_unclaimed_jobs(&InstanceId::new("crashed"))
            .await
            .unwrap();
        let (coordinator, scanner) = setup(&store);

        assert!(scanner.reconcile().await.unwrap().claimed.is_empty());

        store.advance_clock(Duration::from_secs(31)).await;
        assert_eq!(scanner.reconcile().await.unwrap().claimed, vec![job.id]);
        assert!(coordinator.is_held(job.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_cancelled() {
        let store = Arc::new(MemoryJobOrm::new());
        let (coordinator, scanner) = setup(&store);
        store.set_notifications_enabled(false).await;
        let job = store.create_job(sample_job("late")).await.unwrap();

        let cancel = CancellationToken::new();
        let scanner = Arc::new(scanner);
        let task = {
            let scanner = scanner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scanner.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(coordinator.is_held(job.id).await);

        cancel.cancel();
        task.await.unwrap();
    }
}
