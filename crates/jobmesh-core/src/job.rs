//! Job definitions, claims and recorded job errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineSpec;
use crate::{Error, InstanceId, ResourceId, Result};

/// Kind of job. Only used as a discriminator here; the evaluator decides
/// what each type means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Cron,
    Webhook,
    DirectRequest,
    FluxMonitor,
    Keeper,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Cron => "cron",
            JobType::Webhook => "webhook",
            JobType::DirectRequest => "direct_request",
            JobType::FluxMonitor => "flux_monitor",
            JobType::Keeper => "keeper",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cron" => Ok(JobType::Cron),
            "webhook" => Ok(JobType::Webhook),
            "direct_request" | "directrequest" => Ok(JobType::DirectRequest),
            "flux_monitor" | "fluxmonitor" => Ok(JobType::FluxMonitor),
            "keeper" => Ok(JobType::Keeper),
            other => Err(Error::Validation(format!("unknown job type: {}", other))),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lease an instance holds on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub claimed_by: InstanceId,
    pub claimed_at: DateTime<Utc>,
}

/// A stored job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    pub name: String,
    pub job_type: JobType,
    pub pipeline_spec_id: ResourceId,
    pub pipeline_spec: PipelineSpec,
    pub claim: Option<Claim>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_claimed(&self) -> bool {
        self.claim.is_some()
    }

    pub fn is_claimed_by(&self, instance: &InstanceId) -> bool {
        self.claim
            .as_ref()
            .is_some_and(|c| &c.claimed_by == instance)
    }
}

/// A job definition that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub job_type: JobType,
    pub pipeline_spec: PipelineSpec,
}

impl NewJob {
    pub fn new(name: impl Into<String>, job_type: JobType, pipeline_spec: PipelineSpec) -> Self {
        Self {
            name: name.into(),
            job_type,
            pipeline_spec,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("job name must not be empty".to_string()));
        }
        self.pipeline_spec.validate()
    }
}

/// An error raised while executing a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub id: ResourceId,
    pub job_id: ResourceId,
    pub description: String,
    /// How many times this description was recorded while undismissed.
    pub occurrences: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dismissed_at: Option<DateTime<Utc>>,
}

impl JobError {
    pub fn is_dismissed(&self) -> bool {
        self.dismissed_at.is_some()
    }
}
