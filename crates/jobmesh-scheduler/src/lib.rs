//! Node-side coordination for jobmesh.
//!
//! Tracks the jobs this process has claimed, keeps their leases alive,
//! reacts to job change notifications, reconciles on a timer and records
//! job errors without blocking execution.

pub mod coordinator;
pub mod error;
pub mod listener;
pub mod logging;
pub mod node;
pub mod reconciler;
pub mod recorder;
pub mod runner;

pub use coordinator::ClaimCoordinator;
pub use error::{SchedulerError, SchedulerResult};
pub use listener::{ChangeKind, ChangeListener};
pub use node::Node;
pub use reconciler::{Reconciliation, ReconciliationScanner};
pub use recorder::{ErrorRecorder, RecorderDrain};
pub use runner::JobRunner;
