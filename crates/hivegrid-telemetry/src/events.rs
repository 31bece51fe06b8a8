//! Pool event bus — how the core notifies the display collaborator.
//!
//! Fire-and-forget broadcast: the core publishes after each successful
//! metrics update or pool-setting change, and any number of subscribers
//! (dashboard, logs, tests) consume at their own pace. A lagging or
//! absent subscriber never blocks the control loop.

use hivegrid_state::{MetricsSnapshot, NodeId};
use tokio::sync::broadcast;
use tracing::trace;

/// Events surfaced to whatever sits outside the core.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A metrics snapshot was assembled and persisted.
    SnapshotRecorded(MetricsSnapshot),
    /// A node's upstream address changed via `update_pool_settings`.
    UpstreamChanged {
        node_id: NodeId,
        upstream_address: String,
    },
}

/// Cloneable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: PoolEvent) {
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(delivered, "pool event published");
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
