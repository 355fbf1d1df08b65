//! Evaluator trait.
//!
//! The evaluator runs a claimed job's task graph. jobmesh only persists what
//! it returns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::job::Job;
use crate::pipeline::RunStatus;

/// Outcome of evaluating a job's pipeline once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Terminal status. `Running` is not a valid outcome.
    pub status: RunStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn completed(output: serde_json::Value) -> Self {
        Self {
            status: RunStatus::Completed,
            output: Some(output),
            error: None,
        }
    }

    pub fn errored(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Errored,
            output: None,
            error: Some(error.into()),
        }
    }

    /// Outcome of a run stopped before the evaluator finished.
    pub fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            output: None,
            error: None,
        }
    }
}

/// Trait for pipeline evaluators.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Name of this evaluator.
    fn name(&self) -> &'static str;

    /// Evaluate the job's pipeline once.
    async fn evaluate(&self, job: &Job) -> Result<RunOutcome>;
}

/// Evaluator that completes every run with an empty output.
pub struct NoopEvaluator;

#[async_trait]
impl Evaluator for NoopEvaluator {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn evaluate(&self, _job: &Job) -> Result<RunOutcome> {
        Ok(RunOutcome::completed(serde_json::Value::Null))
    }
}
