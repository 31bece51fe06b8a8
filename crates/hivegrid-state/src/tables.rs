//! redb table definitions for the hivegrid persistence store.
//!
//! Nodes and workers use `&str` keys (their ids) and `&[u8]` values
//! (JSON-serialized domain types). Snapshots use a monotone `u64` sequence
//! key so the oldest entries sort first and FIFO eviction stays cheap.

use redb::TableDefinition;

/// Node configs keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Worker configs keyed by `{worker_id}`.
///
/// A worker keeps a single row for its whole life; migrations rewrite
/// `current_node_id` in place rather than re-keying.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Metrics snapshots keyed by an ever-increasing sequence number.
pub const SNAPSHOTS: TableDefinition<u64, &[u8]> = TableDefinition::new("snapshots");

/// Monotonic id counters keyed by counter name (`"worker"`, `"node"`, `"snapshot"`).
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
