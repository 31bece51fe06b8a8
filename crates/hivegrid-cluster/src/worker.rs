//! Worker — a unit of continuous work bound to exactly one node.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use hivegrid_state::{NodeId, StateStore, WorkerConfig, WorkerId};
use hivegrid_telemetry::TelemetrySource;

use crate::error::{ClusterError, ClusterResult};

/// Keys a settings patch may carry. Anything else is rejected.
pub const ALLOWED_SETTING_KEYS: &[&str] = &["intensity", "threads", "priority", "affinity"];

/// A worker performs one continuous throughput-producing task on behalf of
/// its parent node. Telemetry accessors delegate to the injected source and
/// never fail; configuration changes are persisted before they return.
pub struct Worker {
    id: WorkerId,
    algorithm: String,
    parent_node_id: NodeId,
    settings: BTreeMap<String, String>,
    telemetry: Arc<dyn TelemetrySource>,
    store: StateStore,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        algorithm: String,
        parent_node_id: NodeId,
        telemetry: Arc<dyn TelemetrySource>,
        store: StateStore,
    ) -> Self {
        Self {
            id,
            algorithm,
            parent_node_id,
            settings: BTreeMap::new(),
            telemetry,
            store,
        }
    }

    /// Rebuild a worker from its persisted config.
    pub fn from_config(
        config: WorkerConfig,
        telemetry: Arc<dyn TelemetrySource>,
        store: StateStore,
    ) -> Self {
        Self {
            id: config.id,
            algorithm: config.algorithm,
            parent_node_id: config.current_node_id,
            settings: config.settings,
            telemetry,
            store,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn parent_node_id(&self) -> &str {
        &self.parent_node_id
    }

    pub fn settings(&self) -> &BTreeMap<String, String> {
        &self.settings
    }

    /// The durable view of this worker.
    pub fn config(&self) -> WorkerConfig {
        WorkerConfig {
            id: self.id.clone(),
            algorithm: self.algorithm.clone(),
            current_node_id: self.parent_node_id.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Current throughput, straight from telemetry.
    pub fn report_throughput(&self) -> f64 {
        self.telemetry.throughput(&self.id)
    }

    /// Current power draw, straight from telemetry.
    pub fn report_power(&self) -> f64 {
        self.telemetry.power(&self.id)
    }

    /// Merge a validated settings patch: patch keys overwrite, others are
    /// retained. The merged config is persisted before the in-memory state
    /// changes, so a store failure leaves the worker untouched.
    pub fn merge_settings(&mut self, patch: &BTreeMap<String, String>) -> ClusterResult<()> {
        for (key, value) in patch {
            if !ALLOWED_SETTING_KEYS.contains(&key.as_str()) {
                return Err(ClusterError::ConfigMerge(format!("unknown key: {key}")));
            }
            if value.is_empty() {
                return Err(ClusterError::ConfigMerge(format!("empty value for key: {key}")));
            }
        }

        let mut merged = self.settings.clone();
        for (key, value) in patch {
            merged.insert(key.clone(), value.clone());
        }

        let mut config = self.config();
        config.settings = merged.clone();
        self.store.put_worker_config(&config)?;

        self.settings = merged;
        debug!(worker_id = %self.id, keys = patch.len(), "worker settings merged");
        Ok(())
    }

    /// Move this worker's ownership to `new_node_id` and persist it.
    ///
    /// Discipline invariant: only [`Node::migrate_worker_out`] may call
    /// this — calling it anywhere else bypasses node-collection
    /// consistency. Not enforceable at the type level; documented here.
    ///
    /// [`Node::migrate_worker_out`]: crate::node::Node::migrate_worker_out
    pub(crate) fn reassign_to(&mut self, new_node_id: &str) -> ClusterResult<()> {
        let previous = std::mem::replace(&mut self.parent_node_id, new_node_id.to_string());
        if let Err(e) = self.store.put_worker_config(&self.config()) {
            self.parent_node_id = previous;
            return Err(e.into());
        }
        debug!(worker_id = %self.id, from = %previous, to = %new_node_id, "worker reassigned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivegrid_telemetry::StaticTelemetry;

    fn test_worker(store: &StateStore) -> Worker {
        let telemetry = StaticTelemetry::new().with_worker("w1", 42.0, 130.0);
        Worker::new(
            "w1".to_string(),
            "blake3".to_string(),
            "n1".to_string(),
            Arc::new(telemetry),
            store.clone(),
        )
    }

    fn patch(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn telemetry_accessors_delegate() {
        let store = StateStore::open_in_memory().unwrap();
        let worker = test_worker(&store);
        assert_eq!(worker.report_throughput(), 42.0);
        assert_eq!(worker.report_power(), 130.0);
    }

    #[test]
    fn merge_overwrites_patched_keys_and_keeps_the_rest() {
        let store = StateStore::open_in_memory().unwrap();
        let mut worker = test_worker(&store);

        worker
            .merge_settings(&patch(&[("intensity", "high"), ("threads", "4")]))
            .unwrap();
        worker.merge_settings(&patch(&[("threads", "8")])).unwrap();

        assert_eq!(worker.settings()["intensity"], "high");
        assert_eq!(worker.settings()["threads"], "8");
    }

    #[test]
    fn merge_persists_to_store() {
        let store = StateStore::open_in_memory().unwrap();
        let mut worker = test_worker(&store);

        worker.merge_settings(&patch(&[("priority", "2")])).unwrap();

        let persisted = store.get_worker_config("w1").unwrap().unwrap();
        assert_eq!(persisted.settings["priority"], "2");
    }

    #[test]
    fn merge_rejects_unknown_key() {
        let store = StateStore::open_in_memory().unwrap();
        let mut worker = test_worker(&store);

        let result = worker.merge_settings(&patch(&[("voltage", "1.1")]));
        assert!(matches!(result, Err(ClusterError::ConfigMerge(_))));
        assert!(worker.settings().is_empty());
    }

    #[test]
    fn merge_rejects_empty_value() {
        let store = StateStore::open_in_memory().unwrap();
        let mut worker = test_worker(&store);

        let result = worker.merge_settings(&patch(&[("threads", "")]));
        assert!(matches!(result, Err(ClusterError::ConfigMerge(_))));
    }

    #[test]
    fn reassign_updates_parent_and_persists() {
        let store = StateStore::open_in_memory().unwrap();
        let mut worker = test_worker(&store);

        worker.reassign_to("n2").unwrap();

        assert_eq!(worker.parent_node_id(), "n2");
        let persisted = store.get_worker_config("w1").unwrap().unwrap();
        assert_eq!(persisted.current_node_id, "n2");
    }
}
