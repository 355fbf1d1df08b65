//! Run a node until SIGINT or SIGTERM.

use anyhow::Result;
use jobmesh_config::NodeConfig;
use jobmesh_core::evaluator::NoopEvaluator;
use jobmesh_core::telemetry::TelemetryAgent;
use jobmesh_db::{JobOrm, MemoryJobOrm};
use jobmesh_scheduler::Node;
use jobmesh_scheduler::logging::service_log_directives;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{logging, shutdown};

pub async fn run(config: NodeConfig, in_memory: bool) -> Result<()> {
    let (store, directives) = open_store(&config, in_memory).await?;
    logging::init(&config, &directives);
    if in_memory {
        warn!("Using a process-local store; jobs are not shared with other nodes");
    } else {
        info!("Database connected");
    }

    let shutdown = shutdown::install_shutdown_handler();
    let node = Node::start(
        store,
        Arc::new(NoopEvaluator),
        Arc::new(TelemetryAgent::disabled()),
        &config,
        &shutdown,
    )
    .await?;
    info!(instance_id = %node.instance_id(), "Node running, press Ctrl-C to stop");

    shutdown.cancelled().await;
    node.shutdown().await?;
    Ok(())
}

/// Open the store and read its log level overrides. Runs before logging is
/// initialised, so failures are returned rather than logged.
async fn open_store(
    config: &NodeConfig,
    in_memory: bool,
) -> Result<(Arc<dyn JobOrm>, Vec<String>)> {
    if in_memory {
        let memory = Arc::new(MemoryJobOrm::new().with_lease_ttl(config.lease_ttl));
        let directives = service_log_directives(memory.as_ref(), config.store_timeout).await;
        let store: Arc<dyn JobOrm> = memory;
        Ok((store, directives))
    } else {
        let pg = Arc::new(super::connect(config).await?);
        let directives = service_log_directives(pg.as_ref(), config.store_timeout).await;
        let store: Arc<dyn JobOrm> = pg;
        Ok((store, directives))
    }
}
