//! StateStore — redb-backed persistence for the hivegrid pool.
//!
//! Holds the durable mirror of node/worker configuration, the bounded
//! metrics history, and the monotonic id counters. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Maximum number of metrics snapshots retained; oldest evicted first.
pub const SNAPSHOT_CAPACITY: usize = 50;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe persistence store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(WORKERS).map_err(map_err!(Table))?;
        txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node config.
    pub fn put_node_config(&self, config: &NodeConfig) -> StateResult<()> {
        let value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(config.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = %config.id, "node config stored");
        Ok(())
    }

    /// Get a node config by id.
    pub fn get_node_config(&self, node_id: &str) -> StateResult<Option<NodeConfig>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(node_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let config: NodeConfig =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    /// Load every persisted node config, in ascending id order.
    pub fn load_all_node_configs(&self) -> StateResult<Vec<NodeConfig>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let config: NodeConfig =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(config);
        }
        Ok(results)
    }

    /// Delete a node config by id. Returns true if it existed.
    pub fn delete_node_config(&self, node_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(node_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_id, existed, "node config deleted");
        Ok(existed)
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Insert or update a worker config.
    ///
    /// A migration rewrites `current_node_id` in the same row, so ownership
    /// is announced by calling this again with the new parent.
    pub fn put_worker_config(&self, config: &WorkerConfig) -> StateResult<()> {
        let value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            table
                .insert(config.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(worker_id = %config.id, node_id = %config.current_node_id, "worker config stored");
        Ok(())
    }

    /// Get a worker config by id.
    pub fn get_worker_config(&self, worker_id: &str) -> StateResult<Option<WorkerConfig>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
        match table.get(worker_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let config: WorkerConfig =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    /// List the workers currently assigned to a node, in ascending id order.
    pub fn load_workers_for_node(&self, node_id: &str) -> StateResult<Vec<WorkerConfig>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let config: WorkerConfig =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if config.current_node_id == node_id {
                results.push(config);
            }
        }
        Ok(results)
    }

    /// Delete a worker config by id. Returns true if it existed.
    pub fn delete_worker_config(&self, worker_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            existed = table.remove(worker_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Append a metrics snapshot, evicting the oldest entries beyond
    /// [`SNAPSHOT_CAPACITY`] in the same transaction.
    pub fn record_snapshot(&self, snapshot: &MetricsSnapshot) -> StateResult<()> {
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let seq = counters
                .get("snapshot")
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            counters.insert("snapshot", seq).map_err(map_err!(Write))?;

            let mut table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
            table.insert(seq, value.as_slice()).map_err(map_err!(Write))?;

            // Sequence keys sort ascending, so the oldest rows come first.
            let mut keys: Vec<u64> = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                keys.push(key.value());
            }
            if keys.len() > SNAPSHOT_CAPACITY {
                for key in &keys[..keys.len() - SNAPSHOT_CAPACITY] {
                    table.remove(*key).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List the retained snapshots, oldest first.
    pub fn list_snapshots(&self) -> StateResult<Vec<MetricsSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let snapshot: MetricsSnapshot =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(snapshot);
        }
        Ok(results)
    }

    /// The most recently recorded snapshot, if any.
    pub fn latest_snapshot(&self) -> StateResult<Option<MetricsSnapshot>> {
        Ok(self.list_snapshots()?.pop())
    }

    // ── Id counters ────────────────────────────────────────────────

    /// Allocate the next worker id (`w1`, `w2`, ...). Monotonic for the
    /// lifetime of the store, including across reopens.
    pub fn next_worker_id(&self) -> StateResult<WorkerId> {
        Ok(format!("w{}", self.next_counter("worker")?))
    }

    /// Allocate the next node id (`n1`, `n2`, ...).
    pub fn next_node_id(&self) -> StateResult<NodeId> {
        Ok(format!("n{}", self.next_counter("node")?))
    }

    fn next_counter(&self, name: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            next = table
                .get(name)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            table.insert(name, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn test_node(id: &str) -> NodeConfig {
        NodeConfig {
            id: id.to_string(),
            status: NodeStatus::Active,
            connection_info: "10.0.0.1:7000".to_string(),
            upstream_address: "tcp://upstream:9000".to_string(),
        }
    }

    fn test_worker(id: &str, node_id: &str) -> WorkerConfig {
        WorkerConfig {
            id: id.to_string(),
            algorithm: "blake3".to_string(),
            current_node_id: node_id.to_string(),
            settings: BTreeMap::new(),
        }
    }

    fn test_snapshot(timestamp: u64) -> MetricsSnapshot {
        let mut workers = BTreeMap::new();
        workers.insert(
            "w1".to_string(),
            WorkerSample {
                throughput: 42.0,
                power: 120.0,
                accepted: 10,
                rejected: 1,
                temperature: 61.5,
            },
        );
        MetricsSnapshot { timestamp, workers }
    }

    // ── Node CRUD ──────────────────────────────────────────────────

    #[test]
    fn node_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let node = test_node("n1");

        store.put_node_config(&node).unwrap();
        let retrieved = store.get_node_config("n1").unwrap();

        assert_eq!(retrieved, Some(node));
    }

    #[test]
    fn node_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_node_config("nope").unwrap().is_none());
    }

    #[test]
    fn node_list_all_sorted_by_id() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node_config(&test_node("n2")).unwrap();
        store.put_node_config(&test_node("n1")).unwrap();

        let all = store.load_all_node_configs().unwrap();
        let ids: Vec<&str> = all.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2"]);
    }

    #[test]
    fn node_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut node = test_node("n1");
        store.put_node_config(&node).unwrap();

        node.upstream_address = "tcp://other:9001".to_string();
        store.put_node_config(&node).unwrap();

        let retrieved = store.get_node_config("n1").unwrap().unwrap();
        assert_eq!(retrieved.upstream_address, "tcp://other:9001");
        assert_eq!(store.load_all_node_configs().unwrap().len(), 1);
    }

    #[test]
    fn node_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node_config(&test_node("n1")).unwrap();

        assert!(store.delete_node_config("n1").unwrap());
        assert!(!store.delete_node_config("n1").unwrap());
        assert!(store.get_node_config("n1").unwrap().is_none());
    }

    // ── Worker CRUD ────────────────────────────────────────────────

    #[test]
    fn worker_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let worker = test_worker("w1", "n1");

        store.put_worker_config(&worker).unwrap();
        assert_eq!(store.get_worker_config("w1").unwrap(), Some(worker));
    }

    #[test]
    fn workers_filtered_by_node() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_worker_config(&test_worker("w1", "n1")).unwrap();
        store.put_worker_config(&test_worker("w2", "n1")).unwrap();
        store.put_worker_config(&test_worker("w3", "n2")).unwrap();

        let n1 = store.load_workers_for_node("n1").unwrap();
        assert_eq!(n1.len(), 2);
        let n2 = store.load_workers_for_node("n2").unwrap();
        assert_eq!(n2.len(), 1);
        assert_eq!(n2[0].id, "w3");
    }

    #[test]
    fn worker_reassignment_moves_between_nodes() {
        let store = StateStore::open_in_memory().unwrap();
        let mut worker = test_worker("w1", "n1");
        store.put_worker_config(&worker).unwrap();

        worker.current_node_id = "n2".to_string();
        store.put_worker_config(&worker).unwrap();

        assert!(store.load_workers_for_node("n1").unwrap().is_empty());
        assert_eq!(store.load_workers_for_node("n2").unwrap().len(), 1);
    }

    #[test]
    fn worker_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_worker_config(&test_worker("w1", "n1")).unwrap();

        assert!(store.delete_worker_config("w1").unwrap());
        assert!(store.get_worker_config("w1").unwrap().is_none());
    }

    // ── Snapshots ──────────────────────────────────────────────────

    #[test]
    fn snapshot_record_and_list() {
        let store = StateStore::open_in_memory().unwrap();
        for ts in [1000, 1010, 1020] {
            store.record_snapshot(&test_snapshot(ts)).unwrap();
        }

        let all = store.list_snapshots().unwrap();
        assert_eq!(all.len(), 3);
        // Oldest first.
        assert_eq!(all[0].timestamp, 1000);
        assert_eq!(store.latest_snapshot().unwrap().unwrap().timestamp, 1020);
    }

    #[test]
    fn snapshot_retention_evicts_oldest() {
        let store = StateStore::open_in_memory().unwrap();
        for ts in 0..60u64 {
            store.record_snapshot(&test_snapshot(ts)).unwrap();
        }

        let all = store.list_snapshots().unwrap();
        assert_eq!(all.len(), SNAPSHOT_CAPACITY);
        // The 50 most recent remain: timestamps 10..=59.
        assert_eq!(all.first().unwrap().timestamp, 10);
        assert_eq!(all.last().unwrap().timestamp, 59);
    }

    // ── Id counters ────────────────────────────────────────────────

    #[test]
    fn worker_ids_are_monotonic() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.next_worker_id().unwrap(), "w1");
        assert_eq!(store.next_worker_id().unwrap(), "w2");
        assert_eq!(store.next_worker_id().unwrap(), "w3");
    }

    #[test]
    fn node_and_worker_counters_are_independent() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.next_node_id().unwrap(), "n1");
        assert_eq!(store.next_worker_id().unwrap(), "w1");
        assert_eq!(store.next_node_id().unwrap(), "n2");
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_node_config(&test_node("n1")).unwrap();
            store.put_worker_config(&test_worker("w1", "n1")).unwrap();
            assert_eq!(store.next_worker_id().unwrap(), "w1");
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_node_config("n1").unwrap().is_some());
        assert_eq!(store.load_workers_for_node("n1").unwrap().len(), 1);
        // Counter keeps counting where it left off.
        assert_eq!(store.next_worker_id().unwrap(), "w2");
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.load_all_node_configs().unwrap().is_empty());
        assert!(store.load_workers_for_node("any").unwrap().is_empty());
        assert!(store.list_snapshots().unwrap().is_empty());
        assert!(store.latest_snapshot().unwrap().is_none());
        assert!(!store.delete_node_config("nope").unwrap());
        assert!(!store.delete_worker_config("nope").unwrap());
    }
}
