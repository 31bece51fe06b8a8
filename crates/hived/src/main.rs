//! hived — the hivegrid daemon.
//!
//! Single binary that assembles the subsystems and runs the control loop:
//! - State store (redb)
//! - Synthetic telemetry source
//! - Monitor + event bus
//! - Cluster manager (restored from the store, or bootstrapped)
//!
//! Everything is constructed here, once, and passed by reference —
//! there are no process-wide singletons.
//!
//! # Usage
//!
//! ```text
//! hived --data-dir /var/lib/hivegrid --tick-interval 10
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{Mutex, watch};
use tracing::info;

use hivegrid_cluster::{ClusterConfig, ClusterManager, ControlLoop, DeferredPolicy};
use hivegrid_telemetry::{EventBus, Monitor, PoolEvent, SyntheticTelemetry};

#[derive(Parser)]
#[command(name = "hived", about = "Hivegrid node pool daemon")]
struct Cli {
    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/hivegrid")]
    data_dir: PathBuf,

    /// Control tick interval in seconds.
    #[arg(long, default_value = "10")]
    tick_interval: u64,

    /// Delay before a freshly provisioned node can receive a worker, in seconds.
    #[arg(long, default_value = "5")]
    provision_delay: u64,

    /// Load above which a node is rebalanced.
    #[arg(long, default_value = "0.8")]
    overload_threshold: f64,

    /// Upstream address for bootstrap and provisioned nodes.
    #[arg(long, default_value = "tcp://127.0.0.1:9000")]
    upstream: String,

    /// How often to retry a failed deferred migration (0 = abandon).
    #[arg(long, default_value = "0")]
    deferred_retries: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hived=debug,hivegrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    info!("hivegrid daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&cli.data_dir)?;
    let db_path = cli.data_dir.join("hivegrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = hivegrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let telemetry = Arc::new(SyntheticTelemetry::new());
    let events = EventBus::default();

    let monitor = Arc::new(Monitor::new(
        store.clone(),
        telemetry.clone(),
        events.clone(),
    ));
    info!("monitor initialized");

    let config = ClusterConfig {
        overload_threshold: cli.overload_threshold,
        default_upstream: cli.upstream.clone(),
        provision_delay: Duration::from_secs(cli.provision_delay),
        deferred_policy: if cli.deferred_retries == 0 {
            DeferredPolicy::Abandon
        } else {
            DeferredPolicy::Retry {
                max_attempts: cli.deferred_retries,
            }
        },
        ..ClusterConfig::default()
    };

    let mut manager = ClusterManager::new(store, telemetry.clone(), events.clone(), config);
    manager.initialize_from_store()?;
    info!(
        nodes = manager.node_ids().len(),
        workers = manager.total_worker_count(),
        "cluster manager initialized"
    );
    let manager = Arc::new(Mutex::new(manager));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    // Stand-in for the display collaborator: log what it would show.
    let mut display_rx = events.subscribe();
    let mut display_shutdown = shutdown_rx.clone();
    let display_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = display_rx.recv() => match event {
                    Ok(PoolEvent::SnapshotRecorded(snapshot)) => {
                        info!(workers = snapshot.workers.len(), timestamp = snapshot.timestamp, "snapshot");
                    }
                    Ok(PoolEvent::UpstreamChanged { node_id, upstream_address }) => {
                        info!(%node_id, %upstream_address, "upstream changed");
                    }
                    Err(_) => break,
                },
                _ = display_shutdown.changed() => break,
            }
        }
    });

    // Drift the synthetic telemetry so loads move between ticks.
    let drift_telemetry = telemetry.clone();
    let mut drift_shutdown = shutdown_rx.clone();
    let drift_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => drift_telemetry.advance(),
                _ = drift_shutdown.changed() => break,
            }
        }
    });

    // ── Control loop ───────────────────────────────────────────

    let control = ControlLoop::new(
        manager,
        monitor,
        Duration::from_secs(cli.tick_interval),
    );
    let control_handle = tokio::spawn(control.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = control_handle.await;
    let _ = display_handle.await;
    let _ = drift_handle.await;

    info!("hivegrid daemon stopped");
    Ok(())
}
