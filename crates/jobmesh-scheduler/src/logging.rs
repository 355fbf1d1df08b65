//! Per-service log level overrides read from the store.

use jobmesh_db::{LogLevelRepo, with_deadline};
use std::time::Duration;
use tracing::warn;

/// Services whose level can be overridden, and the module each maps to.
pub const SERVICES: [(&str, &str); 5] = [
    ("claim", "jobmesh_scheduler::coordinator"),
    ("listener", "jobmesh_scheduler::listener"),
    ("reconciler", "jobmesh_scheduler::reconciler"),
    ("recorder", "jobmesh_scheduler::recorder"),
    ("runner", "jobmesh_scheduler::runner"),
];

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Filter directives (`target=level`) for every service with a stored
/// override. Unreadable or unknown levels are skipped.
pub async fn service_log_directives(repo: &dyn LogLevelRepo, deadline: Duration) -> Vec<String> {
    let mut directives = Vec::new();
    for (service, target) in SERVICES {
        match with_deadline(deadline, repo.service_log_level(service)).await {
            Ok(Some(level)) => {
                let level = level.trim().to_ascii_lowercase();
                if LEVELS.contains(&level.as_str()) {
                    directives.push(format!("{}={}", target, level));
                } else {
                    warn!(service, level = %level, "Ignoring unknown log level override");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(service, error = %e, "Failed to read log level override");
            }
        }
    }
    directives
}
