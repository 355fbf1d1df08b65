//! Fire-and-forget job error recording.
//!
//! Recording never blocks the execution path: events go into a bounded
//! queue drained by a background task. A full queue or a failed write is
//! logged and the event is dropped.

use jobmesh_core::{JobError, ResourceId};
use jobmesh_db::{JobErrorRepo, JobOrm, with_deadline};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SchedulerResult;

#[derive(Debug)]
struct ErrorEvent {
    job_id: ResourceId,
    description: String,
}

/// Handle for recording and dismissing job errors. Cheap to clone.
#[derive(Clone)]
pub struct ErrorRecorder {
    tx: mpsc::Sender<ErrorEvent>,
    store: Arc<dyn JobOrm>,
    deadline: Duration,
}

/// The receiving half of an `ErrorRecorder`'s queue.
pub struct RecorderDrain {
    rx: mpsc::Receiver<ErrorEvent>,
    store: Arc<dyn JobOrm>,
    deadline: Duration,
}

impl ErrorRecorder {
    pub fn new(
        store: Arc<dyn JobOrm>,
        queue_size: usize,
        deadline: Duration,
    ) -> (Self, RecorderDrain) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let recorder = Self {
            tx,
            store: store.clone(),
            deadline,
        };
        let drain = RecorderDrain {
            rx,
            store,
            deadline,
        };
        (recorder, drain)
    }

    /// Queue an error for `job_id`. Returns immediately.
    pub fn record_error(&self, job_id: ResourceId, description: impl Into<String>) {
        let event = ErrorEvent {
            job_id,
            description: description.into(),
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(job_id = %event.job_id, description = %event.description, "Error queue full, dropping job error");
            }
            Err(TrySendError::Closed(event)) => {
                warn!(job_id = %event.job_id, description = %event.description, "Error recorder stopped, dropping job error");
            }
        }
    }

    pub async fn dismiss_error(&self, id: ResourceId) -> SchedulerResult<()> {
        with_deadline(self.deadline, self.store.dismiss_error(id)).await?;
        info!(error_id = %id, "Dismissed job error");
        Ok(())
    }

    pub async fn job_errors(&self, job_id: ResourceId) -> SchedulerResult<Vec<JobError>> {
        Ok(with_deadline(self.deadline, self.store.job_errors(job_id)).await?)
    }
}

impl RecorderDrain {
    /// Write queued errors until `cancel` fires, then flush what is already
    /// queued.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("Error recorder started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.write(event).await;
        }

        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            self.write(event).await;
        }
        debug!("Error recorder stopped");
    }

    async fn write(&self, event: ErrorEvent) {
        match with_deadline(
            self.deadline,
            self.store.record_error(event.job_id, &event.description),
        )
        .await
        {
            Ok(recorded) => {
                debug!(job_id = %event.job_id, occurrences = recorded.occurrences, "Recorded job error");
            }
            Err(e) => {
                warn!(job_id = %event.job_id, error = %e, "Failed to record job error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_job;
    use jobmesh_db::{JobRepo, MemoryJobOrm};

    const DEADLINE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_recorded_errors_reach_store() {
        let store = Arc::new(MemoryJobOrm::new());
        let job = store.create_job(sample_job("alpha")).await.unwrap();
        let (recorder, drain) = ErrorRecorder::new(store.clone(), 16, DEADLINE);

        recorder.record_error(job.id, "bridge timed out");
        recorder.record_error(job.id, "bridge timed out");
        recorder.record_error(job.id, "bad response");

        let cancel = CancellationToken::new();
        cancel.cancel();
        drain.run(cancel).await;

        let errors = recorder.job_errors(job.id).await.unwrap();
        assert_eq!(errors.len(), 2);
        let timed_out = errors
            .iter()
            .find(|e| e.description == "bridge timed out")
            .unwrap();
        assert_eq!(timed_out.occurrences, 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let store = Arc::new(MemoryJobOrm::new());
        let job = store.create_job(sample_job("alpha")).await.unwrap();
        let (recorder, drain) = ErrorRecorder::new(store.clone(), 1, DEADLINE);

        recorder.record_error(job.id, "first");
        recorder.record_error(job.id, "second");

        let cancel = CancellationToken::new();
        cancel.cancel();
        drain.run(cancel).await;

        let errors = recorder.job_errors(job.id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].description, "first");
    }

    #[tokio::test]
    async fn test_error_for_deleted_job_is_swallowed() {
        let store = Arc::new(MemoryJobOrm::new());
        let (recorder, drain) = ErrorRecorder::new(store.clone(), 4, DEADLINE);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(drain.run(cancel.clone()));

        recorder.record_error(ResourceId::new(), "orphan");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dismiss_error() {
        let store = Arc::new(MemoryJobOrm::new());
        let job = store.create_job(sample_job("alpha")).await.unwrap();
        let (recorder, drain) = ErrorRecorder::new(store.clone(), 4, DEADLINE);
        recorder.record_error(job.id, "boom");
        let cancel = CancellationToken::new();
        cancel.cancel();
        drain.run(cancel).await;

        let error = recorder.job_errors(job.id).await.unwrap().remove(0);
        recorder.dismiss_error(error.id).await.unwrap();
        recorder.dismiss_error(error.id).await.unwrap();
        assert!(recorder.job_errors(job.id).await.unwrap().is_empty());

        assert!(recorder.dismiss_error(ResourceId::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_stopped_recorder_drops_events() {
        let store = Arc::new(MemoryJobOrm::new());
        let job = store.create_job(sample_job("alpha")).await.unwrap();
        let (recorder, drain) = ErrorRecorder::new(store.clone(), 4, DEADLINE);
        drop(drain);

        recorder.record_error(job.id, "nobody listening");
        assert!(recorder.job_errors(job.id).await.unwrap().is_empty());
    }
}
