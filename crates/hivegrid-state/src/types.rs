//! Domain types for the hivegrid persistence store.
//!
//! These represent the durable side of the pool: node and worker
//! configuration (never live telemetry) and timestamped metrics snapshots.
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a node in the pool.
pub type NodeId = String;

/// Unique identifier for a worker.
pub type WorkerId = String;

// ── Node ──────────────────────────────────────────────────────────

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Spun up for a deferred migration, not yet serving.
    Provisioning,
    Active,
}

/// Durable configuration of a node.
///
/// Load is deliberately absent: it is derived state, recomputed from the
/// live workers before every use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub id: NodeId,
    pub status: NodeStatus,
    /// Opaque connection metadata for the node itself (bind address etc.).
    pub connection_info: String,
    /// Address of the node's outbound upstream link.
    pub upstream_address: String,
}

// ── Worker ────────────────────────────────────────────────────────

/// Durable configuration of a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub id: WorkerId,
    /// Opaque tag describing the task type; immutable after creation.
    pub algorithm: String,
    /// The node that owns this worker right now.
    pub current_node_id: NodeId,
    /// Free-form-looking but schema-validated settings (see the cluster crate).
    pub settings: BTreeMap<String, String>,
}

// ── Metrics ───────────────────────────────────────────────────────

/// One worker's telemetry reading inside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSample {
    pub throughput: f64,
    pub power: f64,
    pub accepted: u64,
    pub rejected: u64,
    pub temperature: f64,
}

/// Point-in-time capture of all workers' telemetry.
///
/// Immutable after creation; the store retains a bounded FIFO history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    /// Unix timestamp (seconds) when the snapshot was assembled.
    pub timestamp: u64,
    pub workers: BTreeMap<WorkerId, WorkerSample>,
}
