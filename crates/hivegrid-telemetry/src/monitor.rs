//! Monitor — assembles per-tick metrics snapshots.
//!
//! The monitor is the only component that reads telemetry for snapshot
//! purposes: each tick it samples every worker, builds one immutable
//! `MetricsSnapshot`, records it to the state store (bounded FIFO history),
//! and publishes it for the display collaborator. The rebalancer reads
//! telemetry separately through the worker accessors — an accepted
//! redundancy, since readings are idempotent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::debug;

use hivegrid_state::{MetricsSnapshot, StateResult, StateStore, WorkerId};

use crate::events::{EventBus, PoolEvent};
use crate::source::TelemetrySource;

pub struct Monitor {
    store: StateStore,
    telemetry: Arc<dyn TelemetrySource>,
    events: EventBus,
    latest: watch::Sender<Option<MetricsSnapshot>>,
}

impl Monitor {
    pub fn new(store: StateStore, telemetry: Arc<dyn TelemetrySource>, events: EventBus) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            store,
            telemetry,
            events,
            latest,
        }
    }

    /// Sample every worker, persist the snapshot, and publish it.
    ///
    /// Persistence failures propagate — a snapshot that never reached the
    /// store must not be advertised as recorded.
    pub fn update_all_metrics(&self, worker_ids: &[WorkerId]) -> StateResult<MetricsSnapshot> {
        let mut workers = BTreeMap::new();
        for worker_id in worker_ids {
            workers.insert(worker_id.clone(), self.telemetry.sample(worker_id));
        }

        let snapshot = MetricsSnapshot {
            timestamp: epoch_secs(),
            workers,
        };

        self.store.record_snapshot(&snapshot)?;
        self.latest.send_replace(Some(snapshot.clone()));
        self.events
            .publish(PoolEvent::SnapshotRecorded(snapshot.clone()));

        debug!(
            workers = snapshot.workers.len(),
            timestamp = snapshot.timestamp,
            "metrics snapshot recorded"
        );
        Ok(snapshot)
    }

    /// Watch handle over the most recent snapshot, for the display side.
    pub fn latest(&self) -> watch::Receiver<Option<MetricsSnapshot>> {
        self.latest.subscribe()
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticTelemetry;

    fn test_monitor(telemetry: StaticTelemetry) -> (Monitor, StateStore, EventBus) {
        let store = StateStore::open_in_memory().unwrap();
        let events = EventBus::new(8);
        let monitor = Monitor::new(store.clone(), Arc::new(telemetry), events.clone());
        (monitor, store, events)
    }

    #[tokio::test]
    async fn snapshot_covers_every_worker() {
        let telemetry = StaticTelemetry::new()
            .with_worker("w1", 10.0, 100.0)
            .with_worker("w2", 50.0, 220.0);
        let (monitor, _, _) = test_monitor(telemetry);

        let snapshot = monitor
            .update_all_metrics(&["w1".to_string(), "w2".to_string()])
            .unwrap();

        assert_eq!(snapshot.workers.len(), 2);
        assert_eq!(snapshot.workers["w1"].throughput, 10.0);
        assert_eq!(snapshot.workers["w2"].power, 220.0);
    }

    #[tokio::test]
    async fn snapshot_is_persisted_and_published() {
        let telemetry = StaticTelemetry::new().with_worker("w1", 10.0, 100.0);
        let (monitor, store, events) = test_monitor(telemetry);
        let mut rx = events.subscribe();

        monitor.update_all_metrics(&["w1".to_string()]).unwrap();

        assert_eq!(store.list_snapshots().unwrap().len(), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            PoolEvent::SnapshotRecorded(_)
        ));
    }

    #[tokio::test]
    async fn latest_watch_tracks_newest_snapshot() {
        let telemetry = StaticTelemetry::new().with_worker("w1", 10.0, 100.0);
        let (monitor, _, _) = test_monitor(telemetry);
        let rx = monitor.latest();

        assert!(rx.borrow().is_none());
        monitor.update_all_metrics(&["w1".to_string()]).unwrap();
        assert!(rx.borrow().is_some());
    }

    #[tokio::test]
    async fn empty_worker_list_records_empty_snapshot() {
        let (monitor, store, _) = test_monitor(StaticTelemetry::new());

        let snapshot = monitor.update_all_metrics(&[]).unwrap();
        assert!(snapshot.workers.is_empty());
        assert_eq!(store.list_snapshots().unwrap().len(), 1);
    }
}
