//! Job definition parsing.
//!
//! ```kdl
//! job "eth-usd" type="flux_monitor"
//!
//! task "fetch" {
//!     bridge "coingecko"
//! }
//!
//! task "parse" needs="fetch" {
//!     jsonparse "data" "price"
//! }
//! ```

use crate::kdl_ext::{
    get_all_string_args, get_first_string_arg, get_string_list_prop, get_string_prop,
};
use crate::{ConfigError, ConfigResult};
use jobmesh_core::{JobType, NewJob, PipelineSpec, Task, TaskKind};
use kdl::{KdlDocument, KdlNode};
use std::path::Path;

/// Parse and validate a job definition from KDL text.
pub fn parse_job(kdl: &str) -> ConfigResult<NewJob> {
    let doc: KdlDocument = kdl.parse()?;

    let mut header: Option<(String, JobType)> = None;
    let mut tasks = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "job" => {
                if header.is_some() {
                    return Err(ConfigError::Duplicate("job".to_string()));
                }
                let name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;
                let job_type = get_string_prop(node, "type")
                    .ok_or_else(|| ConfigError::MissingField("job type".to_string()))?
                    .parse::<JobType>()?;
                header = Some((name, job_type));
            }
            "task" => tasks.push(parse_task(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    let (name, job_type) = header.ok_or_else(|| ConfigError::MissingField("job".to_string()))?;
    let job = NewJob::new(name, job_type, PipelineSpec::new(tasks));
    job.validate()?;
    Ok(job)
}

/// Read and parse a job definition file.
pub fn parse_job_file(path: impl AsRef<Path>) -> ConfigResult<NewJob> {
    let text = std::fs::read_to_string(path)?;
    parse_job(&text)
}

fn parse_task(node: &KdlNode) -> ConfigResult<Task> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("task name".to_string()))?;
    let needs = get_string_list_prop(node, "needs");

    let mut kind = None;
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let parsed = match child.name().value() {
                "bridge" => Some(TaskKind::Bridge {
                    name: required_arg(&name, child)?,
                }),
                "http" => {
                    let args = get_all_string_args(child);
                    match args.as_slice() {
                        [method, url] => Some(TaskKind::Http {
                            method: method.to_uppercase(),
                            url: url.clone(),
                        }),
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                field: format!("http for task '{}'", name),
                                message: "expected a method and a url".to_string(),
                            });
                        }
                    }
                }
                "jsonparse" => Some(TaskKind::JsonParse {
                    path: get_all_string_args(child),
                }),
                "multiply" => Some(TaskKind::Multiply {
                    times: required_arg(&name, child)?,
                }),
                "median" => Some(TaskKind::Median),
                _ => None,
            };

            if let Some(parsed) = parsed {
                if kind.is_some() {
                    return Err(ConfigError::Duplicate(format!("action for task '{}'", name)));
                }
                kind = Some(parsed);
            }
        }
    }

    let kind =
        kind.ok_or_else(|| ConfigError::MissingField(format!("action for task '{}'", name)))?;

    Ok(Task { name, needs, kind })
}

fn required_arg(task: &str, node: &KdlNode) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::InvalidValue {
        field: format!("{} for task '{}'", node.name().value(), task),
        message: "expected a string argument".to_string(),
    })
}
