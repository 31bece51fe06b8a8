//! hivegrid-cluster — the pool rebalancing core.
//!
//! Owns the live topology (nodes owning workers), computes per-node load,
//! and relocates the hottest worker off an overloaded node each tick:
//!
//! ```text
//! ControlLoop (one tick)
//!   ├── Monitor::update_all_metrics      (snapshot → store → event bus)
//!   └── ClusterManager::monitor_and_rebalance
//!         ├── Node::is_overloaded        (load recomputed from telemetry)
//!         ├── candidate: max-throughput worker on the hot node
//!         ├── target: least-loaded other node, or a freshly provisioned one
//!         └── Node::migrate_worker_out   (ownership persisted mid-move)
//! ```
//!
//! Ownership is strict: the manager owns the node map, a node owns its
//! workers, and every configuration change is announced to the state store
//! before the operation returns.

pub mod control;
pub mod error;
pub mod manager;
pub mod node;
pub mod worker;

pub use control::ControlLoop;
pub use error::{ClusterError, ClusterResult};
pub use manager::{
    ClusterConfig, ClusterManager, DeferredPolicy, PendingMigration, RebalanceOutcome,
};
pub use node::{DEFAULT_OVERLOAD_THRESHOLD, NODE_CAPACITY, Node};
pub use worker::Worker;
