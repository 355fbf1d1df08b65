//! Cancellable stream of job ids.

use jobmesh_core::ResourceId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Notification channel for newly created jobs.
pub const NEW_JOBS_CHANNEL: &str = "insert_on_jobs";
/// Notification channel for deleted jobs.
pub const DELETED_JOBS_CHANNEL: &str = "delete_from_jobs";

/// Buffered ids per subscription. A full buffer makes the Postgres
/// forwarder wait; the in-memory store drops the id with a warning.
pub(crate) const SUBSCRIPTION_BUFFER: usize = 1024;

/// A live subscription to one notification channel.
///
/// Delivery is at-least-once and best-effort. Closing (or dropping) the
/// subscription stops delivery immediately, including ids that were
/// already buffered.
pub struct Subscription {
    channel: &'static str,
    rx: mpsc::Receiver<ResourceId>,
    cancel: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        channel: &'static str,
        rx: mpsc::Receiver<ResourceId>,
        cancel: CancellationToken,
        forwarder: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            channel,
            rx,
            cancel,
            forwarder,
        }
    }

    /// Wait for the next id. Returns `None` once the subscription is closed,
    /// either locally or because its store shut down.
    pub async fn recv(&mut self) -> Option<ResourceId> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            id = self.rx.recv() => id,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Release the underlying channel. Never waits on an in-flight delivery.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription() -> (Subscription, mpsc::Sender<ResourceId>) {
        let (tx, rx) = mpsc::channel(8);
        let sub = Subscription::new(NEW_JOBS_CHANNEL, rx, CancellationToken::new(), None);
        (sub, tx)
    }

    #[tokio::test]
    async fn test_recv_delivers_in_order() {
        let (mut sub, tx) = subscription();
        let a = ResourceId::new();
        let b = ResourceId::new();
        tx.send(a).await.unwrap();
        tx.send(b).await.unwrap();

        assert_eq!(sub.recv().await, Some(a));
        assert_eq!(sub.recv().await, Some(b));
    }

    #[tokio::test]
    async fn test_close_drops_buffered_ids() {
        let (mut sub, tx) = subscription();
        tx.send(ResourceId::new()).await.unwrap();

        sub.close();

        assert!(sub.is_closed());
        assert_eq!(sub.recv().await, None);
        assert!(tx.send(ResourceId::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_token_ends_pending_recv() {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let mut sub = Subscription::new(DELETED_JOBS_CHANNEL, rx, cancel.clone(), None);

        let waiter = tokio::spawn(async move { sub.recv().await });
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), None);
        drop(tx);
    }
}
