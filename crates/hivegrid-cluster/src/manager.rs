//! ClusterManager — owns the node pool and runs the rebalancing decisions.
//!
//! One manager instance owns the whole node map; nobody holds a
//! back-reference to it. All "first found" selections iterate the map in
//! ascending node-id order, which makes every tie-break deterministic.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use hivegrid_state::{NodeId, NodeStatus, StateStore, WorkerId};
use hivegrid_telemetry::{EventBus, PoolEvent, TelemetrySource};

use crate::error::{ClusterError, ClusterResult};
use crate::node::{DEFAULT_OVERLOAD_THRESHOLD, Node};
use crate::worker::Worker;

/// What to do when a deferred migration fails (its destination never became
/// usable, or the candidate vanished meanwhile). The reference behavior
/// left this open; here it is configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredPolicy {
    /// Log and drop the pending migration.
    Abandon,
    /// Re-schedule up to `max_attempts` total attempts, then drop.
    Retry { max_attempts: u32 },
}

/// Tunables for the manager, assembled once at startup and injected.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Load above which a node is rebalanced.
    pub overload_threshold: f64,
    /// Upstream address given to bootstrap and provisioned nodes.
    pub default_upstream: String,
    /// Algorithm tag for the bootstrap worker.
    pub default_algorithm: String,
    /// How long a provisioned node needs before it can receive a worker.
    pub provision_delay: Duration,
    pub deferred_policy: DeferredPolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            overload_threshold: DEFAULT_OVERLOAD_THRESHOLD,
            default_upstream: "tcp://127.0.0.1:9000".to_string(),
            default_algorithm: "blake3".to_string(),
            provision_delay: Duration::from_secs(2),
            deferred_policy: DeferredPolicy::Abandon,
        }
    }
}

/// A migration decided now but executed after the provisioning delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMigration {
    pub worker_id: WorkerId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    /// 1-based attempt counter, bumped on every retry.
    pub attempt: u32,
}

impl PendingMigration {
    fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Result of one rebalancing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceOutcome {
    /// The worker moved immediately.
    Migrated {
        worker_id: WorkerId,
        from: NodeId,
        to: NodeId,
    },
    /// A node was provisioned; the move runs after the provisioning delay.
    Scheduled(PendingMigration),
}

pub struct ClusterManager {
    /// Node id → node. BTreeMap iteration order *is* the selection order.
    nodes: BTreeMap<NodeId, Node>,
    store: StateStore,
    telemetry: Arc<dyn TelemetrySource>,
    events: EventBus,
    config: ClusterConfig,
}

impl ClusterManager {
    pub fn new(
        store: StateStore,
        telemetry: Arc<dyn TelemetrySource>,
        events: EventBus,
        config: ClusterConfig,
    ) -> Self {
        Self {
            nodes: BTreeMap::new(),
            store,
            telemetry,
            events,
            config,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    // ── Startup ────────────────────────────────────────────────────

    /// Rebuild the pool from the store, or bootstrap a default node with
    /// one default worker when the store is empty.
    ///
    /// Node→worker assignment comes from the persisted worker configs and
    /// nothing else: every worker lands on exactly the node its
    /// `current_node_id` records.
    pub fn initialize_from_store(&mut self) -> ClusterResult<()> {
        let configs = self.store.load_all_node_configs()?;
        if configs.is_empty() {
            let upstream = self.config.default_upstream.clone();
            let algorithm = self.config.default_algorithm.clone();
            let node_id = self.spin_up_new_node(upstream, NodeStatus::Active)?;
            let worker_id = self.create_worker(&node_id, &algorithm)?;
            info!(%node_id, %worker_id, "bootstrapped empty pool");
            return Ok(());
        }

        for mut config in configs {
            // A node persisted mid-provisioning means its deferred
            // migration died with the previous process. The delay has long
            // elapsed; restore it as a usable target.
            if config.status == NodeStatus::Provisioning {
                config.status = NodeStatus::Active;
                self.store.put_node_config(&config)?;
                warn!(node_id = %config.id, "provisioning node restored as active");
            }
            let mut node = Node::from_config(&config);
            for worker_config in self.store.load_workers_for_node(&config.id)? {
                node.add_worker(Worker::from_config(
                    worker_config,
                    Arc::clone(&self.telemetry),
                    self.store.clone(),
                ));
            }
            self.nodes.insert(node.id().to_string(), node);
        }

        info!(
            nodes = self.nodes.len(),
            workers = self.total_worker_count(),
            "pool restored from store"
        );
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Allocate a fresh node id, construct the node, persist its config,
    /// and register it. Returns the new id.
    pub fn spin_up_new_node(
        &mut self,
        upstream_address: String,
        status: NodeStatus,
    ) -> ClusterResult<NodeId> {
        let id = self.store.next_node_id()?;
        let node = Node::new(id.clone(), format!("local://{id}"), upstream_address, status);
        self.store.put_node_config(&node.config())?;
        self.nodes.insert(id.clone(), node);
        info!(node_id = %id, ?status, "node spun up");
        Ok(id)
    }

    /// Create a worker on an existing node and persist it. The node is
    /// resolved before anything is written, so a bad node id leaves no
    /// orphan worker row behind.
    pub fn create_worker(&mut self, node_id: &str, algorithm: &str) -> ClusterResult<WorkerId> {
        if !self.nodes.contains_key(node_id) {
            return Err(ClusterError::NodeNotFound(node_id.to_string()));
        }
        let id = self.store.next_worker_id()?;
        let worker = Worker::new(
            id.clone(),
            algorithm.to_string(),
            node_id.to_string(),
            Arc::clone(&self.telemetry),
            self.store.clone(),
        );
        self.store.put_worker_config(&worker.config())?;
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))?
            .add_worker(worker);
        info!(worker_id = %id, %node_id, %algorithm, "worker created");
        Ok(id)
    }

    // ── Rebalancing ────────────────────────────────────────────────

    /// One rebalancing pass: find the first overloaded node (ascending id,
    /// nodes with a migration already pending are skipped) and rebalance
    /// it. At most one migration per tick — a deliberate rate limit.
    pub fn monitor_and_rebalance(&mut self) -> ClusterResult<Option<RebalanceOutcome>> {
        let threshold = self.config.overload_threshold;
        let mut overloaded = None;
        for node in self.nodes.values_mut() {
            if node.migration_in_flight() {
                continue;
            }
            if node.is_overloaded(threshold) {
                overloaded = Some(node.id().to_string());
                break;
            }
        }

        let Some(node_id) = overloaded else {
            return Ok(None);
        };

        debug!(%node_id, "node overloaded, rebalancing");
        match self.rebalance_node(&node_id) {
            Ok(outcome) => Ok(Some(outcome)),
            // An overloaded node with nothing to move is left alone.
            Err(ClusterError::NoMigrationCandidate(id)) => {
                warn!(node_id = %id, "overloaded node has no workers to move");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Move the hottest worker off `node_id`: immediately when a target
    /// node exists, otherwise by provisioning a new node and scheduling
    /// the move after the provisioning delay (reported as success).
    pub fn rebalance_node(&mut self, node_id: &str) -> ClusterResult<RebalanceOutcome> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))?;

        // Highest throughput wins; ties broken by current position.
        let candidate = node
            .workers()
            .iter()
            .fold(None::<(&Worker, f64)>, |best, worker| {
                let throughput = worker.report_throughput();
                match best {
                    Some((_, top)) if throughput <= top => best,
                    _ => Some((worker, throughput)),
                }
            })
            .map(|(worker, _)| worker.id().to_string())
            .ok_or_else(|| ClusterError::NoMigrationCandidate(node_id.to_string()))?;

        if let Some(target_id) = self.find_least_used_node(node_id) {
            self.migrate_between(node_id, &candidate, &target_id)?;
            info!(worker_id = %candidate, from = %node_id, to = %target_id, "worker rebalanced");
            return Ok(RebalanceOutcome::Migrated {
                worker_id: candidate,
                from: node_id.to_string(),
                to: target_id,
            });
        }

        // No peer exists: provision a node and defer the move until it is
        // ready. The in-flight flag keeps this node out of later passes.
        let upstream = self
            .nodes
            .get(node_id)
            .map(|n| n.upstream_address().to_string())
            .unwrap_or_else(|| self.config.default_upstream.clone());
        let target_id = self.spin_up_new_node(upstream, NodeStatus::Provisioning)?;
        if let Some(source) = self.nodes.get_mut(node_id) {
            source.set_migration_in_flight(true);
        }

        let pending = PendingMigration {
            worker_id: candidate,
            source_node_id: node_id.to_string(),
            target_node_id: target_id.clone(),
            attempt: 1,
        };
        info!(
            worker_id = %pending.worker_id,
            from = %node_id,
            to = %target_id,
            "no eligible target, migration scheduled onto provisioned node"
        );
        Ok(RebalanceOutcome::Scheduled(pending))
    }

    /// The node with minimum recomputed load, excluding `exclude`.
    /// Ties go to the lowest node id. `None` when no candidate remains.
    pub fn find_least_used_node(&mut self, exclude: &str) -> Option<NodeId> {
        let mut best: Option<(NodeId, f64)> = None;
        for (id, node) in self.nodes.iter_mut() {
            if id == exclude {
                continue;
            }
            let load = node.compute_load();
            match &best {
                Some((_, lowest)) if load >= *lowest => {}
                _ => best = Some((id.clone(), load)),
            }
        }
        best.map(|(id, _)| id)
    }

    /// Execute a deferred migration once its provisioning delay elapsed.
    ///
    /// Clears the source's in-flight flag, re-checks that the candidate is
    /// still where it was, performs the move, and activates the target
    /// node. On failure the configured [`DeferredPolicy`] decides: a retry
    /// returns the re-armed pending migration, abandonment returns `None`.
    /// Store failures propagate regardless — state must not silently
    /// diverge from the durable record.
    pub fn complete_deferred(
        &mut self,
        pending: &PendingMigration,
    ) -> ClusterResult<Option<PendingMigration>> {
        if let Some(source) = self.nodes.get_mut(&pending.source_node_id) {
            source.set_migration_in_flight(false);
        }

        match self.try_deferred(pending) {
            Ok(()) => {
                info!(
                    worker_id = %pending.worker_id,
                    from = %pending.source_node_id,
                    to = %pending.target_node_id,
                    attempt = pending.attempt,
                    "deferred migration completed"
                );
                Ok(None)
            }
            Err(ClusterError::State(e)) => Err(ClusterError::State(e)),
            Err(e) => match self.config.deferred_policy {
                DeferredPolicy::Retry { max_attempts } if pending.attempt < max_attempts => {
                    warn!(
                        error = %e,
                        attempt = pending.attempt,
                        max_attempts,
                        "deferred migration failed, re-scheduling"
                    );
                    if let Some(source) = self.nodes.get_mut(&pending.source_node_id) {
                        source.set_migration_in_flight(true);
                    }
                    Ok(Some(pending.next_attempt()))
                }
                _ => {
                    warn!(error = %e, "deferred migration abandoned");
                    Ok(None)
                }
            },
        }
    }

    /// Drop a pending migration without executing it (shutdown path).
    pub fn cancel_deferred(&mut self, pending: &PendingMigration) {
        if let Some(source) = self.nodes.get_mut(&pending.source_node_id) {
            source.set_migration_in_flight(false);
        }
        info!(
            worker_id = %pending.worker_id,
            to = %pending.target_node_id,
            "deferred migration cancelled"
        );
    }

    fn try_deferred(&mut self, pending: &PendingMigration) -> ClusterResult<()> {
        let still_owned = self
            .nodes
            .get(&pending.source_node_id)
            .is_some_and(|node| node.has_worker(&pending.worker_id));
        if !still_owned {
            return Err(ClusterError::WorkerNotFound(pending.worker_id.clone()));
        }

        self.migrate_between(
            &pending.source_node_id,
            &pending.worker_id,
            &pending.target_node_id,
        )?;

        if let Some(target) = self.nodes.get_mut(&pending.target_node_id) {
            target.set_status(NodeStatus::Active);
            self.store.put_node_config(&target.config())?;
        }
        Ok(())
    }

    /// Run `migrate_worker_out` between two nodes of the map. The target
    /// is taken out of the map for the duration of the move so both sides
    /// can be borrowed mutably.
    fn migrate_between(
        &mut self,
        source_id: &str,
        worker_id: &str,
        target_id: &str,
    ) -> ClusterResult<()> {
        let mut target = self
            .nodes
            .remove(target_id)
            .ok_or_else(|| ClusterError::NodeNotFound(target_id.to_string()))?;

        let result = match self.nodes.get_mut(source_id) {
            Some(source) => source.migrate_worker_out(worker_id, &mut target),
            None => Err(ClusterError::NodeNotFound(source_id.to_string())),
        };

        self.nodes.insert(target.id().to_string(), target);
        result
    }

    // ── Pool settings ──────────────────────────────────────────────

    /// Point the node owning `worker_id` at a new upstream address and
    /// persist it. An unknown worker id reports `false` and mutates
    /// nothing.
    pub fn update_pool_settings(
        &mut self,
        worker_id: &str,
        new_address: &str,
    ) -> ClusterResult<bool> {
        let Some(node) = self.nodes.values_mut().find(|n| n.has_worker(worker_id)) else {
            warn!(%worker_id, "pool settings update for unknown worker");
            return Ok(false);
        };

        // Persist first; a store failure must leave the live node on its
        // old upstream.
        let mut config = node.config();
        config.upstream_address = new_address.to_string();
        self.store.put_node_config(&config)?;
        node.set_upstream_address(new_address.to_string());
        self.events.publish(PoolEvent::UpstreamChanged {
            node_id: node.id().to_string(),
            upstream_address: new_address.to_string(),
        });
        info!(node_id = %node.id(), %worker_id, upstream = %new_address, "pool settings updated");
        Ok(true)
    }

    /// Apply a settings patch to one worker. Reports `false` for an
    /// unknown worker; an invalid patch is an error.
    pub fn update_worker_settings(
        &mut self,
        worker_id: &str,
        patch: &std::collections::BTreeMap<String, String>,
    ) -> ClusterResult<bool> {
        for node in self.nodes.values_mut() {
            if let Some(worker) = node.workers_mut().iter_mut().find(|w| w.id() == worker_id) {
                worker.merge_settings(patch)?;
                return Ok(true);
            }
        }
        warn!(%worker_id, "settings patch for unknown worker");
        Ok(false)
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// Every worker id across the pool, grouped by ascending node id.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.nodes.values().flat_map(Node::worker_ids).collect()
    }

    pub fn total_worker_count(&self) -> usize {
        self.nodes.values().map(Node::worker_count).sum()
    }
}
