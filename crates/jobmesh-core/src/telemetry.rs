//! Best-effort telemetry delivery.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

/// Send-only transport to an external collector.
pub trait TelemetryTransport: Send + Sync {
    /// Hand a payload to the transport. Delivery failures stay inside the
    /// transport.
    fn send(&self, payload: Bytes);
}

/// Thin wrapper over a transport.
pub struct TelemetryAgent {
    transport: Box<dyn TelemetryTransport>,
}

impl TelemetryAgent {
    pub fn new(transport: impl TelemetryTransport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
        }
    }

    /// Agent that drops everything.
    pub fn disabled() -> Self {
        Self::new(NoopTransport)
    }

    pub fn send_log(&self, payload: impl Into<Bytes>) {
        self.transport.send(payload.into());
    }
}

pub struct NoopTransport;

impl TelemetryTransport for NoopTransport {
    fn send(&self, _payload: Bytes) {}
}

/// Forwards payloads into a bounded channel, dropping them when it is full
/// or closed.
pub struct ChannelTransport {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl TelemetryTransport for ChannelTransport {
    fn send(&self, payload: Bytes) {
        if let Err(e) = self.tx.try_send(payload) {
            debug!(error = %e, "Dropping telemetry payload");
        }
    }
}
