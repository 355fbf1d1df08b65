//! Core domain types and traits for jobmesh.
//!
//! This crate contains:
//! - Resource and instance identifiers
//! - Job definitions, claims and job errors
//! - Pipeline specifications and runs
//! - The evaluator seam used to execute claimed jobs
//! - Best-effort telemetry delivery

pub mod error;
pub mod evaluator;
pub mod id;
pub mod job;
pub mod pipeline;
pub mod telemetry;

pub use error::{Error, Result};
pub use id::{InstanceId, ResourceId};
pub use job::{Claim, Job, JobError, JobType, NewJob};
pub use pipeline::{PipelineRun, PipelineSpec, RunStatus, Task, TaskKind};
