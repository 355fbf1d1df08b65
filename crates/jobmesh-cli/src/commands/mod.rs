//! CLI command implementations.

pub mod errors;
pub mod jobs;
pub mod node;
pub mod runs;

use anyhow::{Context, Result};
use jobmesh_config::{NodeConfig, load_node_config, parse_job_file};
use jobmesh_core::ResourceId;
use jobmesh_db::{PgJobOrm, create_pool, run_migrations};
use std::path::Path;

/// Node configuration from `path`, or defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => load_node_config(path)
            .with_context(|| format!("Failed to load node config: {}", path.display())),
        None => Ok(NodeConfig::default()),
    }
}

/// Connect to PostgreSQL and bring the schema up to date. Logs nothing, so
/// it can run before the subscriber is installed.
pub async fn connect(config: &NodeConfig) -> Result<PgJobOrm> {
    let url = config
        .database_url
        .as_deref()
        .context("No database URL; pass --database-url, set DATABASE_URL or node.database-url")?;

    let pool = create_pool(url).await.context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    Ok(PgJobOrm::new(pool).with_lease_ttl(config.lease_ttl))
}

pub(crate) fn parse_id(id: &str) -> Result<ResourceId> {
    id.parse::<ResourceId>()
        .with_context(|| format!("Invalid id: {}", id))
}

pub fn validate(path: &Path, node: bool) -> Result<()> {
    if node {
        let config = load_node_config(path)
            .with_context(|| format!("Configuration error in {}", path.display()))?;
        println!("Node configuration is valid");
        println!("  lease TTL:          {:?}", config.lease_ttl);
        println!("  heartbeat interval: {:?}", config.heartbeat_interval);
        println!("  reconcile interval: {:?}", config.reconcile_interval);
        return Ok(());
    }

    let job = parse_job_file(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;
    println!(
        "Job '{}' is valid ({} type, {} tasks)",
        job.name,
        job.job_type,
        job.pipeline_spec.tasks.len()
    );
    let bridges = job.pipeline_spec.bridge_names();
    if !bridges.is_empty() {
        println!("  bridges: {}", bridges.join(", "));
    }
    Ok(())
}
