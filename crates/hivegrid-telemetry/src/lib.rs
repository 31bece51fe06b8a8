//! hivegrid-telemetry — worker telemetry and the metrics monitor.
//!
//! Telemetry is an external observation: a [`TelemetrySource`] answers
//! throughput/power questions for a worker id on demand and never fails.
//! The [`Monitor`] is the single component that assembles those readings
//! into a `MetricsSnapshot`, persists it to the state store, and publishes
//! it on the [`EventBus`] for whatever display sits downstream.

pub mod events;
pub mod monitor;
pub mod source;

pub use events::{EventBus, PoolEvent};
pub use monitor::Monitor;
pub use source::{StaticTelemetry, SyntheticTelemetry, TelemetrySource};
