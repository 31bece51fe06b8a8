//! Telemetry sources — on-demand performance readings per worker.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use hivegrid_state::WorkerSample;

/// Supplies a worker's current performance numbers on demand.
///
/// Readings are idempotent observations: calling twice in one tick is
/// redundant but harmless. Implementations never fail — a worker without
/// a telemetry source is a wiring error, not a runtime condition — and
/// all values are non-negative.
pub trait TelemetrySource: Send + Sync {
    /// Current throughput of the worker, in work units per second.
    fn throughput(&self, worker_id: &str) -> f64;

    /// Current power draw of the worker, in watts.
    fn power(&self, worker_id: &str) -> f64;

    /// Work results accepted by the upstream so far.
    fn accepted(&self, worker_id: &str) -> u64;

    /// Work results rejected by the upstream so far.
    fn rejected(&self, worker_id: &str) -> u64;

    /// Current temperature of the worker's hardware, in degrees Celsius.
    fn temperature(&self, worker_id: &str) -> f64;

    /// Assemble one full reading for a worker.
    fn sample(&self, worker_id: &str) -> WorkerSample {
        WorkerSample {
            throughput: self.throughput(worker_id),
            power: self.power(worker_id),
            accepted: self.accepted(worker_id),
            rejected: self.rejected(worker_id),
            temperature: self.temperature(worker_id),
        }
    }
}

// ── Synthetic source ──────────────────────────────────────────────

/// Deterministic synthetic telemetry for running without real hardware.
///
/// Each worker gets a stable baseline derived from its id plus a slow
/// drift driven by a shared tick counter, so the numbers move between
/// snapshots without any randomness.
pub struct SyntheticTelemetry {
    tick: AtomicU64,
}

impl SyntheticTelemetry {
    pub fn new() -> Self {
        Self {
            tick: AtomicU64::new(0),
        }
    }

    /// Advance the drift by one step.
    pub fn advance(&self) {
        self.tick.fetch_add(1, Ordering::Relaxed);
    }

    fn baseline(worker_id: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        worker_id.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for SyntheticTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for SyntheticTelemetry {
    fn throughput(&self, worker_id: &str) -> f64 {
        let base = Self::baseline(worker_id) % 50;
        let drift = self.tick.load(Ordering::Relaxed) % 10;
        10.0 + base as f64 + drift as f64
    }

    fn power(&self, worker_id: &str) -> f64 {
        // Roughly proportional to throughput.
        80.0 + self.throughput(worker_id) * 2.0
    }

    fn accepted(&self, worker_id: &str) -> u64 {
        let ticks = self.tick.load(Ordering::Relaxed);
        ticks * (1 + Self::baseline(worker_id) % 4)
    }

    fn rejected(&self, worker_id: &str) -> u64 {
        self.accepted(worker_id) / 50
    }

    fn temperature(&self, worker_id: &str) -> f64 {
        55.0 + (Self::baseline(worker_id) % 15) as f64
    }
}

// ── Static source (tests) ─────────────────────────────────────────

/// Fixed per-worker readings, for tests that need exact load values.
///
/// Unknown workers read as zero on every channel.
#[derive(Default)]
pub struct StaticTelemetry {
    samples: HashMap<String, WorkerSample>,
}

impl StaticTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a worker's throughput and power; counters and temperature zero.
    pub fn with_worker(mut self, worker_id: &str, throughput: f64, power: f64) -> Self {
        self.samples.insert(
            worker_id.to_string(),
            WorkerSample {
                throughput,
                power,
                accepted: 0,
                rejected: 0,
                temperature: 0.0,
            },
        );
        self
    }

    /// Set a worker's full sample.
    pub fn with_sample(mut self, worker_id: &str, sample: WorkerSample) -> Self {
        self.samples.insert(worker_id.to_string(), sample);
        self
    }
}

impl TelemetrySource for StaticTelemetry {
    fn throughput(&self, worker_id: &str) -> f64 {
        self.samples.get(worker_id).map_or(0.0, |s| s.throughput)
    }

    fn power(&self, worker_id: &str) -> f64 {
        self.samples.get(worker_id).map_or(0.0, |s| s.power)
    }

    fn accepted(&self, worker_id: &str) -> u64 {
        self.samples.get(worker_id).map_or(0, |s| s.accepted)
    }

    fn rejected(&self, worker_id: &str) -> u64 {
        self.samples.get(worker_id).map_or(0, |s| s.rejected)
    }

    fn temperature(&self, worker_id: &str) -> f64 {
        self.samples.get(worker_id).map_or(0.0, |s| s.temperature)
    }
}
