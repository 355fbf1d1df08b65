//! Pipeline (task graph) specifications and recorded runs.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use crate::{Error, ResourceId, Result};

static BRIDGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9_-]+$").expect("bridge name pattern is valid")
});

/// The task graph a job executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub tasks: Vec<Task>,
}

/// A single node of the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    /// Upstream task names.
    #[serde(default)]
    pub needs: Vec<String>,
    pub kind: TaskKind,
}

/// What a task does. Opaque to the store apart from bridge references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Call a named external adapter.
    Bridge { name: String },
    Http { method: String, url: String },
    JsonParse { path: Vec<String> },
    Multiply { times: String },
    Median,
}

impl PipelineSpec {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    /// Names of every bridge referenced by this pipeline, deduplicated and
    /// in first-use order.
    pub fn bridge_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.tasks
            .iter()
            .filter_map(|t| match &t.kind {
                TaskKind::Bridge { name } => Some(name.as_str()),
                _ => None,
            })
            .filter(|name| seen.insert(*name))
            .collect()
    }

    pub fn references_bridge(&self, bridge: &str) -> bool {
        self.bridge_names().contains(&bridge)
    }

    /// Check that the task graph is structurally sound.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::Validation("pipeline has no tasks".to_string()));
        }

        let mut names = HashSet::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(Error::Validation("task with empty name".to_string()));
            }
            if !names.insert(task.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate task '{}'",
                    task.name
                )));
            }
            if let TaskKind::Bridge { name } = &task.kind {
                if !BRIDGE_NAME.is_match(name) {
                    return Err(Error::Validation(format!(
                        "task '{}' references malformed bridge name '{}'",
                        task.name, name
                    )));
                }
            }
        }

        for task in &self.tasks {
            for dep in &task.needs {
                if !names.contains(dep.as_str()) {
                    return Err(Error::Validation(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.name, dep
                    )));
                }
            }
        }

        if let Some(cycle) = detect_cycle(&self.tasks) {
            return Err(Error::Validation(format!("cycle detected: {}", cycle)));
        }

        Ok(())
    }
}

/// Detect cycles in the task dependency graph using DFS.
fn detect_cycle(tasks: &[Task]) -> Option<String> {
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let task_map: HashMap<&str, &Task> = tasks.iter().map(|t| (t.name.as_str(), t)).collect();

    tasks.iter().find_map(|task| {
        if visited.contains(task.name.as_str()) {
            None
        } else {
            dfs_detect_cycle(&task.name, &task_map, &mut visited, &mut on_stack)
        }
    })
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    task_map: &HashMap<&'a str, &'a Task>,
    visited: &mut HashSet<&'a str>,
    on_stack: &mut HashSet<&'a str>,
) -> Option<String> {
    visited.insert(node);
    on_stack.insert(node);

    if let Some(&task) = task_map.get(node) {
        for dep in &task.needs {
            let dep = dep.as_str();
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_detect_cycle(dep, task_map, visited, on_stack) {
                    return Some(cycle);
                }
            } else if on_stack.contains(dep) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    on_stack.remove(node);
    None
}

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Errored,
    /// Stopped because the job was released, deleted or lost.
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Errored => "errored",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "errored" => Ok(RunStatus::Errored),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(Error::Internal(format!("unknown run status: {}", other))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded execution attempt of a job's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: ResourceId,
    pub job_id: ResourceId,
    pub status: RunStatus,
    /// Opaque output of the evaluator.
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, needs: Vec<&str>, kind: TaskKind) -> Task {
        Task {
            name: name.to_string(),
            needs: needs.into_iter().map(String::from).collect(),
            kind,
        }
    }

    fn bridge(name: &str) -> TaskKind {
        TaskKind::Bridge {
            name: name.to_string(),
        }
    }

    #[test]
    fn test_valid_pipeline() {
        let spec = PipelineSpec::new(vec![
            task("fetch", vec![], bridge("coingecko")),
            task(
                "parse",
                vec!["fetch"],
                TaskKind::JsonParse {
                    path: vec!["data".into(), "price".into()],
                },
            ),
        ]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_empty_pipeline_is_invalid() {
        let spec = PipelineSpec::new(vec![]);
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_unknown_dependency_is_invalid() {
        let spec = PipelineSpec::new(vec![task("a", vec!["missing"], TaskKind::Median)]);
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("unknown task 'missing'"));
    }

    #[test]
    fn test_duplicate_task_is_invalid() {
        let spec = PipelineSpec::new(vec![
            task("a", vec![], TaskKind::Median),
            task("a", vec![], TaskKind::Median),
        ]);
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_cycle_is_invalid() {
        let spec = PipelineSpec::new(vec![
            task("a", vec!["b"], TaskKind::Median),
            task("b", vec!["a"], TaskKind::Median),
        ]);
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_malformed_bridge_name_is_invalid() {
        let spec = PipelineSpec::new(vec![task("a", vec![], bridge("Not A Bridge"))]);
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_bridge_names_are_deduplicated() {
        let spec = PipelineSpec::new(vec![
            task("a", vec![], bridge("x")),
            task("b", vec![], bridge("y")),
            task("c", vec![], bridge("x")),
        ]);
        assert_eq!(spec.bridge_names(), vec!["x", "y"]);
        assert!(spec.references_bridge("y"));
        assert!(!spec.references_bridge("z"));
    }

    #[test]
    fn test_task_kind_serializes_with_type_tag() {
        let json = serde_json::to_value(bridge("coingecko")).unwrap();
        assert_eq!(json["type"], "bridge");
        assert_eq!(json["name"], "coingecko");
    }

    #[test]
    fn test_cancelled_status_is_terminal() {
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert_eq!(
            "cancelled".parse::<RunStatus>().unwrap(),
            RunStatus::Cancelled
        );
    }
}
