//! A running jobmesh node: every background task wired to one store.

use jobmesh_config::NodeConfig;
use jobmesh_core::InstanceId;
use jobmesh_core::evaluator::Evaluator;
use jobmesh_core::telemetry::TelemetryAgent;
use jobmesh_db::JobOrm;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::SchedulerResult;
use crate::coordinator::ClaimCoordinator;
use crate::listener::{ChangeKind, ChangeListener};
use crate::reconciler::ReconciliationScanner;
use crate::recorder::ErrorRecorder;
use crate::runner::JobRunner;

pub struct Node {
    instance: InstanceId,
    store: Arc<dyn JobOrm>,
    coordinator: Arc<ClaimCoordinator>,
    scanner: Arc<ReconciliationScanner>,
    recorder: ErrorRecorder,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start every background task and make a first claim attempt.
    ///
    /// The node stops when `shutdown` is cancelled, but only releases its
    /// claims and closes the store in [`Node::shutdown`].
    pub async fn start(
        store: Arc<dyn JobOrm>,
        evaluator: Arc<dyn Evaluator>,
        telemetry: Arc<TelemetryAgent>,
        config: &NodeConfig,
        shutdown: &CancellationToken,
    ) -> SchedulerResult<Self> {
        let instance = config
            .instance_id
            .clone()
            .map(InstanceId::new)
            .unwrap_or_else(InstanceId::generate);
        let cancel = shutdown.child_token();
        let deadline = config.store_timeout;

        let (recorder, drain) =
            ErrorRecorder::new(store.clone(), config.recorder_queue_size, deadline);
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            evaluator,
            recorder.clone(),
            telemetry,
            deadline,
        ));
        let coordinator = Arc::new(
            ClaimCoordinator::new(store.clone(), instance.clone(), deadline, cancel.clone())
                .with_runner(runner),
        );
        let listener = Arc::new(ChangeListener::new(store.clone(), coordinator.clone()));
        let scanner = Arc::new(ReconciliationScanner::new(
            store.clone(),
            coordinator.clone(),
            config.reconcile_interval,
            deadline,
        ));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(drain.run(cancel.clone())));
        for kind in [ChangeKind::Created, ChangeKind::Deleted] {
            let listener = listener.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { listener.run(kind, cancel).await }));
        }
        {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            let interval = config.heartbeat_interval;
            tasks.push(tokio::spawn(async move {
                coordinator.run_heartbeat(interval, cancel).await
            }));
        }
        {
            let scanner = scanner.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { scanner.run(cancel).await }));
        }

        match coordinator.claim_unclaimed_jobs().await {
            Ok(claimed) => {
                info!(instance_id = %instance, claimed = claimed.len(), "Node started");
            }
            Err(e) => {
                warn!(instance_id = %instance, error = %e, "Initial claim failed, leaving it to reconciliation");
            }
        }

        Ok(Self {
            instance,
            store,
            coordinator,
            scanner,
            recorder,
            cancel,
            tasks,
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    pub fn coordinator(&self) -> &Arc<ClaimCoordinator> {
        &self.coordinator
    }

    pub fn scanner(&self) -> &Arc<ReconciliationScanner> {
        &self.scanner
    }

    pub fn recorder(&self) -> &ErrorRecorder {
        &self.recorder
    }

    /// Stop every task, release every held claim, then close the store.
    pub async fn shutdown(self) -> SchedulerResult<()> {
        info!(instance_id = %self.instance, "Shutting down node");
        self.cancel.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(instance_id = %self.instance, error = %e, "Background task panicked");
            }
        }

        self.coordinator.release_all().await;
        self.store.close().await?;
        info!(instance_id = %self.instance, "Node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_job, wait_until};
    use jobmesh_core::evaluator::NoopEvaluator;
    use jobmesh_db::{JobRepo, MemoryJobOrm, RunRepo};
    use std::time::Duration;

    fn config(name: &str) -> NodeConfig {
        NodeConfig {
            instance_id: Some(name.to_string()),
            ..NodeConfig::default()
        }
    }

    async fn start(store: &Arc<MemoryJobOrm>, name: &str, shutdown: &CancellationToken) -> Node {
        Node::start(
            store.clone(),
            Arc::new(NoopEvaluator),
            Arc::new(TelemetryAgent::disabled()),
            &config(name),
            shutdown,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_two_nodes_split_jobs() {
        let store = Arc::new(MemoryJobOrm::new());
        let mut ids = Vec::new();
        for i in 1..=3 {
            ids.push(store.create_job(sample_job(&format!("job-{}", i))).await.unwrap().id);
        }
        ids.sort();
        let shutdown = CancellationToken::new();

        let a = start(&store, "node-a", &shutdown).await;
        assert_eq!(a.coordinator().claimed_ids().await, ids);

        let b = start(&store, "node-b", &shutdown).await;
        assert!(b.coordinator().claimed_ids().await.is_empty());

        a.coordinator().unclaim_job(ids[1]).await.unwrap();
        let pass = b.scanner().reconcile().await.unwrap();
        assert_eq!(pass.claimed, vec![ids[1]]);
        assert_eq!(b.coordinator().claimed_ids().await, vec![ids[1]]);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_claimed_jobs_are_run() {
        let store = Arc::new(MemoryJobOrm::new());
        let job = store.create_job(sample_job("alpha")).await.unwrap();
        let shutdown = CancellationToken::new();
        let node = start(&store, "node-a", &shutdown).await;

        assert!(
            wait_until(Duration::from_secs(2), || {
                let store = store.clone();
                async move {
                    let (runs, _) = store.pipeline_runs_by_job_id(job.id, 0, 10).await.unwrap();
                    runs.iter().any(|r| r.finished_at.is_some())
                }
            })
            .await
        );

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_job_is_picked_up_by_notification() {
        let store = Arc::new(MemoryJobOrm::new());
        let shutdown = CancellationToken::new();
        let node = start(&store, "node-a", &shutdown).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let job = store.create_job(sample_job("fresh")).await.unwrap();
        let coordinator = node.coordinator().clone();
        assert!(
            wait_until(Duration::from_secs(2), || {
                let coordinator = coordinator.clone();
                async move { coordinator.is_held(job.id).await }
            })
            .await
        );

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_claims_and_closes_store() {
        let store = Arc::new(MemoryJobOrm::new());
        for i in 0..3 {
            store.create_job(sample_job(&format!("job-{}", i))).await.unwrap();
        }
        let shutdown = CancellationToken::new();
        let node = start(&store, "node-a", &shutdown).await;
        assert_eq!(node.coordinator().claimed_ids().await.len(), 3);

        node.shutdown().await.unwrap();

        assert!(store.jobs_snapshot().await.iter().all(|j| !j.is_claimed()));
        assert!(store.jobs_v2(0, 10).await.is_err());
    }
}
