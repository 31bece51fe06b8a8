//! Control loop — one periodic tick driving the monitor and the manager.
//!
//! Each tick runs `Monitor::update_all_metrics` and then
//! `ClusterManager::monitor_and_rebalance` under one lock, so the two
//! never interleave and a tick never re-enters a running tick. The only
//! suspended operation is a deferred migration: a scheduled rebalance
//! spawns a task that sleeps out the provisioning delay (racing the
//! shutdown watch, which doubles as its cancellation token) and then
//! lands the move through the manager.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use hivegrid_telemetry::Monitor;

use crate::error::ClusterResult;
use crate::manager::{ClusterManager, PendingMigration, RebalanceOutcome};

pub struct ControlLoop {
    manager: Arc<Mutex<ClusterManager>>,
    monitor: Arc<Monitor>,
    tick_interval: Duration,
}

impl ControlLoop {
    pub fn new(
        manager: Arc<Mutex<ClusterManager>>,
        monitor: Arc<Monitor>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            manager,
            monitor,
            tick_interval,
        }
    }

    /// Run ticks until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            "control loop started"
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(&shutdown).await {
                        error!(error = %e, "control tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("control loop shutting down");
                    break;
                }
            }
        }
    }

    /// One tick: metrics first, then at most one rebalancing decision.
    async fn tick(&self, shutdown: &watch::Receiver<bool>) -> ClusterResult<()> {
        let (outcome, provision_delay) = {
            let mut manager = self.manager.lock().await;
            let worker_ids = manager.worker_ids();
            self.monitor.update_all_metrics(&worker_ids)?;
            let outcome = manager.monitor_and_rebalance()?;
            (outcome, manager.config().provision_delay)
        };

        if let Some(RebalanceOutcome::Scheduled(pending)) = outcome {
            self.spawn_deferred(pending, provision_delay, shutdown.clone());
        }
        Ok(())
    }

    /// Wait out the provisioning delay, then complete the migration.
    /// Retries re-arm the same task; shutdown cancels it.
    fn spawn_deferred(
        &self,
        pending: PendingMigration,
        delay: Duration,
        mut cancel: watch::Receiver<bool>,
    ) {
        let manager = Arc::clone(&self.manager);
        let monitor = Arc::clone(&self.monitor);

        tokio::spawn(async move {
            let mut pending = pending;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.changed() => {
                        manager.lock().await.cancel_deferred(&pending);
                        return;
                    }
                }

                let mut guard = manager.lock().await;
                match guard.complete_deferred(&pending) {
                    Ok(None) => {
                        // Refresh metrics so the display sees the move.
                        let worker_ids = guard.worker_ids();
                        drop(guard);
                        if let Err(e) = monitor.update_all_metrics(&worker_ids) {
                            warn!(error = %e, "metrics refresh after deferred migration failed");
                        }
                        return;
                    }
                    Ok(Some(retry)) => {
                        pending = retry;
                    }
                    Err(e) => {
                        error!(error = %e, "deferred migration failed");
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{ClusterConfig, DeferredPolicy};
    use hivegrid_state::{NodeStatus, StateStore};
    use hivegrid_telemetry::{EventBus, StaticTelemetry};

    fn build_loop(
        telemetry: StaticTelemetry,
        config: ClusterConfig,
        tick_interval: Duration,
    ) -> (ControlLoop, Arc<Mutex<ClusterManager>>, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        let telemetry = Arc::new(telemetry);
        let events = EventBus::new(8);
        let monitor = Arc::new(Monitor::new(
            store.clone(),
            telemetry.clone(),
            events.clone(),
        ));
        let manager = Arc::new(Mutex::new(ClusterManager::new(
            store.clone(),
            telemetry,
            events,
            config,
        )));
        let control = ControlLoop::new(Arc::clone(&manager), monitor, tick_interval);
        (control, manager, store)
    }

    #[tokio::test(start_paused = true)]
    async fn tick_records_snapshots() {
        let telemetry = StaticTelemetry::new().with_worker("w1", 30.0, 100.0);
        let (control, manager, store) =
            build_loop(telemetry, ClusterConfig::default(), Duration::from_millis(10));
        {
            let mut mgr = manager.lock().await;
            let n1 = mgr
                .spin_up_new_node("tcp://a:9000".to_string(), NodeStatus::Active)
                .unwrap();
            mgr.create_worker(&n1, "blake3").unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(control.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(35)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(!store.list_snapshots().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_migration_lands_through_the_loop() {
        let telemetry = StaticTelemetry::new().with_worker("w1", 90.0, 300.0);
        let config = ClusterConfig {
            provision_delay: Duration::from_millis(20),
            ..ClusterConfig::default()
        };
        // One tick schedules the move; no second tick fires before the
        // provisioned node is ready, so the landed topology is stable.
        let (control, manager, _) = build_loop(telemetry, config, Duration::from_secs(10));
        {
            let mut mgr = manager.lock().await;
            let n1 = mgr
                .spin_up_new_node("tcp://a:9000".to_string(), NodeStatus::Active)
                .unwrap();
            mgr.create_worker(&n1, "blake3").unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(control.run(shutdown_rx));

        // Enough virtual time for a tick plus the provisioning delay.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let mgr = manager.lock().await;
        assert_eq!(mgr.node_ids(), vec!["n1", "n2"]);
        assert!(mgr.node("n2").unwrap().has_worker("w1"));
        assert_eq!(mgr.node("n2").unwrap().status(), NodeStatus::Active);
        assert_eq!(mgr.total_worker_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_migration() {
        let telemetry = StaticTelemetry::new().with_worker("w1", 90.0, 300.0);
        let config = ClusterConfig {
            // Longer than the test runs, so the deferred task never fires.
            provision_delay: Duration::from_secs(3600),
            deferred_policy: DeferredPolicy::Abandon,
            ..ClusterConfig::default()
        };
        let (control, manager, _) = build_loop(telemetry, config, Duration::from_millis(10));
        {
            let mut mgr = manager.lock().await;
            let n1 = mgr
                .spin_up_new_node("tcp://a:9000".to_string(), NodeStatus::Active)
                .unwrap();
            mgr.create_worker(&n1, "blake3").unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(control.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        // Give the cancelled task a moment to run its cleanup.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mgr = manager.lock().await;
        // The worker never moved and the guard flag is clear again.
        assert!(mgr.node("n1").unwrap().has_worker("w1"));
        assert!(!mgr.node("n1").unwrap().migration_in_flight());
    }
}
