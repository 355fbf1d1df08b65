//! KDL configuration parsing for jobmesh.
//!
//! This crate handles parsing of:
//! - Job definitions (`job "name" type="cron"` plus `task` nodes)
//! - Node configuration (`jobmesh.kdl`)

pub mod error;
pub mod job;
mod kdl_ext;
pub mod node;

pub use error::{ConfigError, ConfigResult};
pub use job::{parse_job, parse_job_file};
pub use node::{NodeConfig, load_node_config, parse_node_config};
