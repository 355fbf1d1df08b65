//! Job change notifications over PostgreSQL LISTEN/NOTIFY.
//!
//! Triggers on `jobs` publish the id of every inserted or deleted row.
//! Each subscription owns a dedicated listener connection and a task that
//! forwards ids into the subscription's buffer.

use async_trait::async_trait;
use jobmesh_core::ResourceId;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::PgJobOrm;
use crate::backoff::Backoff;
use crate::subscription::{
    DELETED_JOBS_CHANNEL, NEW_JOBS_CHANNEL, SUBSCRIPTION_BUFFER, Subscription,
};
use crate::{DbError, DbResult};

#[async_trait]
pub trait JobNotifier: Send + Sync {
    /// Ids of jobs created after the subscription was opened.
    async fn listen_for_new_jobs(&self) -> DbResult<Subscription>;

    /// Ids of jobs deleted after the subscription was opened.
    async fn listen_for_deleted_jobs(&self) -> DbResult<Subscription>;
}

#[async_trait]
impl JobNotifier for PgJobOrm {
    async fn listen_for_new_jobs(&self) -> DbResult<Subscription> {
        self.subscribe(NEW_JOBS_CHANNEL).await
    }

    async fn listen_for_deleted_jobs(&self) -> DbResult<Subscription> {
        self.subscribe(DELETED_JOBS_CHANNEL).await
    }
}

impl PgJobOrm {
    async fn subscribe(&self, channel: &'static str) -> DbResult<Subscription> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| DbError::Delivery(e.to_string()))?;
        listener
            .listen(channel)
            .await
            .map_err(|e| DbError::Delivery(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = self.shutdown.child_token();
        let forwarder = tokio::spawn(forward(listener, channel, tx, cancel.clone()));

        debug!(channel, "Subscribed to job notifications");
        Ok(Subscription::new(channel, rx, cancel, Some(forwarder)))
    }
}

async fn forward(
    mut listener: PgListener,
    channel: &'static str,
    tx: mpsc::Sender<ResourceId>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = listener.try_recv() => next,
        };

        match next {
            Ok(Some(notification)) => {
                backoff.reset();
                let id = match notification.payload().parse::<ResourceId>() {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(channel, payload = notification.payload(), error = %e, "Ignoring malformed job notification");
                        continue;
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(id) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(None) => {
                // The next try_recv reconnects and re-listens. Anything
                // published in between is picked up by reconciliation.
                warn!(channel, "Notification connection lost, reconnecting");
            }
            Err(e) => {
                let err = DbError::Delivery(e.to_string());
                let delay = backoff.next_delay();
                warn!(channel, error = %err, retry_in = ?delay, "Notification listener failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!(channel, "Notification forwarder stopped");
}
