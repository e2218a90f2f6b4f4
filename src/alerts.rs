//! Alert Sinks
//!
//! Alert events are emitted once per upward severity transition and handed to
//! a sink; delivery guarantees (retries, fan-out) belong to the notification
//! collaborator behind the sink, not to the pipeline.

use crate::AlertEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, event: AlertEvent);
}

/// Logs alerts through tracing. The default sink for the binary.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn emit(&self, event: AlertEvent) {
        warn!(
            threat_id = %event.threat_id,
            severity = event.severity.as_str(),
            reason = %event.reason,
            "ALERT raised"
        );
    }
}

/// Forwards alerts into a bounded channel for an external consumer. A full
/// channel drops the event with a warning rather than blocking the pipeline.
pub struct ChannelAlertSink {
    tx: mpsc::Sender<AlertEvent>,
}

impl ChannelAlertSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AlertEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    async fn emit(&self, event: AlertEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "alert consumer lagging, event dropped");
        }
    }
}

/// Collects alerts in memory. Used by tests and embedders that poll.
#[derive(Default)]
pub struct MemoryAlertSink {
    events: Mutex<Vec<AlertEvent>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<AlertEvent> {
        std::mem::take(&mut self.events.lock())
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn emit(&self, event: AlertEvent) {
        self.events.lock().push(event);
    }
}
