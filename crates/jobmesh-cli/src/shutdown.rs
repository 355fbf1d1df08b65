//! Signal handling.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Returns a token that is cancelled on SIGTERM or SIGINT.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
        _ = ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT, initiating graceful shutdown"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    }
}
