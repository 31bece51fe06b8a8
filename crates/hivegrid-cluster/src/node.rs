//! Node — an addressable container of workers with a derived load value.

use tracing::{debug, warn};

use hivegrid_state::{NodeConfig, NodeId, NodeStatus, WorkerId};

use crate::error::{ClusterError, ClusterResult};
use crate::worker::Worker;

/// Fixed capacity a node's aggregate throughput is measured against.
pub const NODE_CAPACITY: f64 = 100.0;

/// Load above which a node is considered overloaded.
pub const DEFAULT_OVERLOAD_THRESHOLD: f64 = 0.8;

/// A virtual compute node hosting workers and one outbound upstream link.
///
/// The node exclusively owns its worker collection. `load_metric` is
/// derived state: it is recomputed from live telemetry before every use
/// and is never treated as authoritative when persisted elsewhere.
pub struct Node {
    id: NodeId,
    workers: Vec<Worker>,
    load_metric: f64,
    connection_info: String,
    upstream_address: String,
    status: NodeStatus,
    /// Set while a deferred migration out of this node is pending, so a
    /// second rebalance cannot start an overlapping move.
    migration_in_flight: bool,
}

impl Node {
    pub fn new(
        id: NodeId,
        connection_info: String,
        upstream_address: String,
        status: NodeStatus,
    ) -> Self {
        Self {
            id,
            workers: Vec::new(),
            load_metric: 0.0,
            connection_info,
            upstream_address,
            status,
            migration_in_flight: false,
        }
    }

    /// Rebuild a node from its persisted config. Workers are attached
    /// separately from their own configs.
    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(
            config.id.clone(),
            config.connection_info.clone(),
            config.upstream_address.clone(),
            config.status,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
    }

    pub fn upstream_address(&self) -> &str {
        &self.upstream_address
    }

    pub fn set_upstream_address(&mut self, address: String) {
        self.upstream_address = address;
    }

    pub fn migration_in_flight(&self) -> bool {
        self.migration_in_flight
    }

    pub fn set_migration_in_flight(&mut self, in_flight: bool) {
        self.migration_in_flight = in_flight;
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn workers_mut(&mut self) -> &mut [Worker] {
        &mut self.workers
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id().to_string()).collect()
    }

    pub fn has_worker(&self, worker_id: &str) -> bool {
        self.workers.iter().any(|w| w.id() == worker_id)
    }

    /// Take ownership of a worker (bootstrap and store-restore path).
    pub fn add_worker(&mut self, worker: Worker) {
        self.workers.push(worker);
    }

    /// The durable view of this node. Load is deliberately not part of it.
    pub fn config(&self) -> NodeConfig {
        NodeConfig {
            id: self.id.clone(),
            status: self.status,
            connection_info: self.connection_info.clone(),
            upstream_address: self.upstream_address.clone(),
        }
    }

    /// Recompute load as aggregate worker throughput over [`NODE_CAPACITY`].
    /// Stores and returns the value.
    pub fn compute_load(&mut self) -> f64 {
        let total: f64 = self.workers.iter().map(Worker::report_throughput).sum();
        self.load_metric = total / NODE_CAPACITY;
        self.load_metric
    }

    /// Whether this node is over the given load threshold. Always
    /// recomputes; never trusts a stale cached value.
    pub fn is_overloaded(&mut self, threshold: f64) -> bool {
        self.compute_load() > threshold
    }

    /// Last computed load. Only meaningful right after [`Self::compute_load`].
    pub fn load_metric(&self) -> f64 {
        self.load_metric
    }

    /// Relocate one worker to `target`, atomically in effect:
    /// remove from this node, persist the new ownership, append to the
    /// target. The ordering means no observer of this single-threaded
    /// loop ever counts the worker on two nodes or on neither.
    ///
    /// An unknown `worker_id` fails with no state change; a persistence
    /// failure puts the worker back where it was and propagates.
    pub fn migrate_worker_out(&mut self, worker_id: &str, target: &mut Node) -> ClusterResult<()> {
        let position = self
            .workers
            .iter()
            .position(|w| w.id() == worker_id)
            .ok_or_else(|| {
                warn!(node_id = %self.id, %worker_id, "migration source does not own worker");
                ClusterError::WorkerNotFound(worker_id.to_string())
            })?;

        let mut worker = self.workers.remove(position);
        if let Err(e) = worker.reassign_to(target.id()) {
            self.workers.insert(position, worker);
            return Err(e);
        }
        target.workers.push(worker);

        debug!(
            %worker_id,
            from = %self.id,
            to = %target.id,
            "worker migrated"
        );
        Ok(())
    }
}
