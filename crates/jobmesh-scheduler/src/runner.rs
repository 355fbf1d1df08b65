//! Executes claimed jobs through the evaluator and records the result.

use jobmesh_core::evaluator::{Evaluator, RunOutcome};
use jobmesh_core::telemetry::TelemetryAgent;
use jobmesh_core::{Job, PipelineRun, RunStatus};
use jobmesh_db::{DbError, JobOrm, RunRepo, with_deadline};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SchedulerResult;
use crate::recorder::ErrorRecorder;

/// Runs a job's pipeline once per call.
pub struct JobRunner {
    store: Arc<dyn JobOrm>,
    evaluator: Arc<dyn Evaluator>,
    recorder: ErrorRecorder,
    telemetry: Arc<TelemetryAgent>,
    deadline: Duration,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobOrm>,
        evaluator: Arc<dyn Evaluator>,
        recorder: ErrorRecorder,
        telemetry: Arc<TelemetryAgent>,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            evaluator,
            recorder,
            telemetry,
            deadline,
        }
    }

    /// Create a run, evaluate the job and store the outcome.
    ///
    /// Returns `None` when the run could not be finished because the job was
    /// deleted underneath it. Cancellation finishes the run as cancelled and
    /// records no error.
    pub async fn run(
        &self,
        job: &Job,
        cancel: CancellationToken,
    ) -> SchedulerResult<Option<PipelineRun>> {
        let run = with_deadline(self.deadline, self.store.create_run(job.id)).await?;
        info!(job_id = %job.id, run_id = %run.id, evaluator = self.evaluator.name(), "Starting run");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => RunOutcome::cancelled(),
            result = self.evaluator.evaluate(job) => match result {
                Ok(outcome) if outcome.status.is_terminal() => outcome,
                Ok(_) => RunOutcome::errored("evaluator returned a non-terminal status"),
                Err(e) => RunOutcome::errored(e.to_string()),
            },
        };

        let finished = match with_deadline(self.deadline, self.store.finish_run(run.id, &outcome))
            .await
        {
            Ok(finished) => finished,
            Err(DbError::NotFound(_)) => {
                debug!(job_id = %job.id, run_id = %run.id, "Job deleted during run");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match finished.status {
            RunStatus::Errored => {
                let description = finished.error.as_deref().unwrap_or("run errored");
                warn!(job_id = %job.id, run_id = %finished.id, error = %description, "Run errored");
                self.recorder.record_error(job.id, description);
            }
            RunStatus::Cancelled => {
                info!(job_id = %job.id, run_id = %finished.id, "Run cancelled");
            }
            _ => {
                info!(job_id = %job.id, run_id = %finished.id, "Run completed");
            }
        }

        self.report(job, &finished);
        Ok(Some(finished))
    }

    fn report(&self, job: &Job, run: &PipelineRun) {
        let summary = serde_json::json!({
            "job_id": job.id,
            "job_name": job.name,
            "job_type": job.job_type,
            "run_id": run.id,
            "status": run.status,
            "error": run.error,
            "created_at": run.created_at,
            "finished_at": run.finished_at,
        });
        match serde_json::to_vec(&summary) {
            Ok(payload) => self.telemetry.send_log(payload),
            Err(e) => debug!(error = %e, "Failed to encode run summary"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{PendingEvaluator, sample_job};
    use async_trait::async_trait;
    use jobmesh_core::evaluator::NoopEvaluator;
    use jobmesh_core::telemetry::ChannelTransport;
    use jobmesh_db::{JobErrorRepo, JobRepo, MemoryJobOrm};

    const DEADLINE: Duration = Duration::from_secs(5);

    struct FailingEvaluator;

    #[async_trait]
    impl Evaluator for FailingEvaluator {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn evaluate(&self, _job: &Job) -> jobmesh_core::Result<RunOutcome> {
            Err(jobmesh_core::Error::EvaluationFailed(
                "bridge returned 500".to_string(),
            ))
        }
    }

    fn runner(
        store: Arc<MemoryJobOrm>,
        evaluator: Arc<dyn Evaluator>,
    ) -> (
        JobRunner,
        crate::recorder::RecorderDrain,
        tokio::sync::mpsc::Receiver<bytes::Bytes>,
    ) {
        let (recorder, drain) = ErrorRecorder::new(store.clone(), 16, DEADLINE);
        let (transport, rx) = ChannelTransport::new(16);
        let runner = JobRunner::new(
            store,
            evaluator,
            recorder,
            Arc::new(TelemetryAgent::new(transport)),
            DEADLINE,
        );
        (runner, drain, rx)
    }

    #[tokio::test]
    async fn test_successful_run_is_completed_and_reported() {
        let store = Arc::new(MemoryJobOrm::new());
        let job = store.create_job(sample_job("alpha")).await.unwrap();
        let (runner, _drain, mut telemetry) = runner(store.clone(), Arc::new(NoopEvaluator));

        let run = runner
            .run(&job, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.finished_at.is_some());

        let payload = telemetry.recv().await.unwrap();
        let summary: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(summary["status"], "completed");
        assert_eq!(summary["job_name"], "alpha");
    }

    #[tokio::test]
    async fn test_evaluator_failure_records_error() {
        let store = Arc::new(MemoryJobOrm::new());
        let job = store.create_job(sample_job("alpha")).await.unwrap();
        let (runner, drain, _telemetry) = runner(store.clone(), Arc::new(FailingEvaluator));

        let run = runner
            .run(&job, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Errored);
        assert!(run.error.as_deref().unwrap().contains("bridge returned 500"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        drain.run(cancel).await;

        let errors = store.job_errors(job.id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].description.contains("bridge returned 500"));
    }

    #[tokio::test]
    async fn test_cancelled_run_records_no_error() {
        let store = Arc::new(MemoryJobOrm::new());
        let job = store.create_job(sample_job("alpha")).await.unwrap();
        let (runner, drain, _telemetry) = runner(store.clone(), Arc::new(PendingEvaluator));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = runner.run(&job, cancel).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.error.is_none());
        assert!(run.finished_at.is_some());

        let cancel = CancellationToken::new();
        cancel.cancel();
        drain.run(cancel).await;
        assert!(store.job_errors(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_for_missing_job_fails() {
        let store = Arc::new(MemoryJobOrm::new());
        let job = store.create_job(sample_job("alpha")).await.unwrap();
        store.delete_job(job.id).await.unwrap();
        let (runner, _drain, _telemetry) = runner(store.clone(), Arc::new(NoopEvaluator));

        let err = runner.run(&job, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            crate::SchedulerError::Store(DbError::NotFound(_))
        ));
    }
}
