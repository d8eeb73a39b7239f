//! Transactional concurrency-control core.
//!
//! This crate is the kernel a database execution layer calls through a
//! narrow transactional API: it enforces row-level locking, isolation-level
//! semantics, and deadlock resolution for concurrently running transactions
//! over a shared in-memory tuple store. SQL parsing, planning, storage
//! formats, and durability are out of scope and belong to the caller.
//!
//! ## Architecture
//!
//! - **Lock manager** (`locks`): shared/exclusive locks on rows, tables, and
//!   predicate ranges; FIFO wait queues per resource under strict two-phase
//!   locking (no lock released before commit/abort).
//! - **Deadlock detector** (`deadlock`): explicit wait-for graph with DFS
//!   cycle detection; victims are the cycle member holding the fewest locks.
//! - **Tuple store** (`store`): MVCC version chains per row, snapshot
//!   visibility, and version garbage collection.
//! - **Transaction manager** (`txn`): transaction table and state machine,
//!   commit/abort, foreign-key enforcement.
//! - **Isolation policy** (`isolation`): table-driven rules per level for
//!   snapshot refresh, lock retention, and commit-time validation.
//! - **Serializable validation** (`validation`): read/write-set tracking and
//!   backward validation against recently committed transactions.
//!
//! ## Usage
//!
//! ```
//! use rowlock::{Engine, EngineConfig, IsolationLevel, TableSchema, Value, row};
//!
//! let engine = Engine::new(EngineConfig::default());
//! engine.create_table(TableSchema::new("produit")).unwrap();
//!
//! let tx = engine.begin(IsolationLevel::ReadCommitted).unwrap();
//! engine
//!     .insert(tx, "produit", &Value::Int(0), row(&[("prix", Value::Int(5))]))
//!     .unwrap();
//! engine.commit(tx).unwrap();
//!
//! let tx = engine.begin(IsolationLevel::RepeatableRead).unwrap();
//! let produit = engine.read(tx, "produit", &Value::Int(0)).unwrap().unwrap();
//! assert_eq!(produit.get("prix"), Some(&Value::Int(5)));
//! engine.commit(tx).unwrap();
//! ```

pub mod deadlock;
pub mod error;
pub mod isolation;
pub mod locks;
pub mod predicates;
pub mod store;
pub mod txn;
pub mod validation;
pub mod value;

pub use deadlock::{DeadlockStats, TxId};
pub use error::{Error, Result};
pub use isolation::IsolationLevel;
pub use locks::{LockMetrics, LockMode, LockResource};
pub use predicates::Predicate;
pub use store::{StoreStats, TableSchema};
pub use txn::{TxnState, TxnStats};
pub use validation::ValidationStats;
pub use value::{row, Row, Value};

use deadlock::DeadlockDetector;
use locks::LockManager;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use store::TupleStore;
use tracing::info;
use txn::TransactionManager;
use validation::SerializationValidator;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on any single lock wait before `LockTimeout`.
    pub lock_timeout: Duration,
    /// Throttle between deadlock detection passes (a pass also runs
    /// unthrottled the moment a request blocks).
    pub deadlock_check_interval: Duration,
    /// Maximum concurrently live transactions.
    pub max_active_transactions: usize,
    /// Run version/record GC every this many commits.
    pub gc_interval_commits: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            deadlock_check_interval: Duration::from_millis(50),
            max_active_transactions: 1024,
            gc_interval_commits: 256,
        }
    }
}

/// Aggregated statistics across all components.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub transactions: TxnStats,
    pub locks: LockMetrics,
    pub deadlocks: DeadlockStats,
    pub validation: ValidationStats,
    pub store: StoreStats,
}

/// One independent engine instance owning all shared state (lock table,
/// wait-for graph, tuple store, transaction table). Instances are fully
/// isolated from each other, so tests can run several side by side;
/// dropping the engine tears everything down.
#[derive(Debug)]
pub struct Engine {
    store: Arc<TupleStore>,
    locks: Arc<LockManager>,
    detector: Arc<DeadlockDetector>,
    validator: Arc<SerializationValidator>,
    txns: TransactionManager,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let detector = Arc::new(DeadlockDetector::new(config.deadlock_check_interval));
        let locks = Arc::new(LockManager::new(detector.clone(), config.lock_timeout));
        let store = Arc::new(TupleStore::new());
        let validator = Arc::new(SerializationValidator::new());
        let txns = TransactionManager::new(
            store.clone(),
            locks.clone(),
            detector.clone(),
            validator.clone(),
            config.max_active_transactions,
            config.gc_interval_commits,
        );
        info!("engine initialized");
        Self {
            store,
            locks,
            detector,
            validator,
            txns,
        }
    }

    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        self.store.create_table(schema)
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<TxId> {
        self.txns.begin(level)
    }

    pub fn read(&self, tx_id: TxId, table: &str, key: &Value) -> Result<Option<Row>> {
        self.txns.read(tx_id, table, key)
    }

    pub fn write(&self, tx_id: TxId, table: &str, key: &Value, updates: Row) -> Result<()> {
        self.txns.write(tx_id, table, key, updates)
    }

    pub fn insert(&self, tx_id: TxId, table: &str, key: &Value, values: Row) -> Result<()> {
        self.txns.insert(tx_id, table, key, values)
    }

    pub fn delete(&self, tx_id: TxId, table: &str, key: &Value) -> Result<()> {
        self.txns.delete(tx_id, table, key)
    }

    /// Snapshot scan of `table` in key order.
    pub fn scan(&self, tx_id: TxId, table: &str, predicate: &Predicate) -> Result<Vec<(Value, Row)>> {
        self.txns.scan(tx_id, table, predicate)
    }

    /// `SELECT ... FOR SHARE`: Shared row lock held to commit, any level.
    pub fn select_for_share(&self, tx_id: TxId, table: &str, key: &Value) -> Result<Option<Row>> {
        self.txns.select_locked(tx_id, table, key, LockMode::Shared)
    }

    /// `SELECT ... FOR UPDATE`: Exclusive row lock held to commit, any level.
    pub fn select_for_update(&self, tx_id: TxId, table: &str, key: &Value) -> Result<Option<Row>> {
        self.txns
            .select_locked(tx_id, table, key, LockMode::Exclusive)
    }

    /// Range `FOR SHARE`: predicate lock held to commit, closing the
    /// phantom gap over the scanned range.
    pub fn scan_for_share(
        &self,
        tx_id: TxId,
        table: &str,
        predicate: &Predicate,
    ) -> Result<Vec<(Value, Row)>> {
        self.txns
            .scan_locked(tx_id, table, predicate, LockMode::Shared)
    }

    /// Range `FOR UPDATE`: exclusive predicate lock held to commit.
    pub fn scan_for_update(
        &self,
        tx_id: TxId,
        table: &str,
        predicate: &Predicate,
    ) -> Result<Vec<(Value, Row)>> {
        self.txns
            .scan_locked(tx_id, table, predicate, LockMode::Exclusive)
    }

    /// `LOCK TABLE ... IN SHARE/EXCLUSIVE MODE`.
    pub fn lock_table(&self, tx_id: TxId, table: &str, mode: LockMode) -> Result<()> {
        self.txns.lock_table(tx_id, table, mode)
    }

    pub fn commit(&self, tx_id: TxId) -> Result<()> {
        self.txns.commit(tx_id)
    }

    pub fn abort(&self, tx_id: TxId) -> Result<()> {
        self.txns.abort(tx_id)
    }

    pub fn state_of(&self, tx_id: TxId) -> Result<TxnState> {
        self.txns.state_of(tx_id)
    }

    /// Granted locks on one table, ordered. Read-only: takes no transaction
    /// locks itself.
    pub fn inspect_locks(&self, table: &str) -> Vec<(LockResource, LockMode, TxId)> {
        self.locks.inspect(table)
    }

    /// Current wait-for graph, for observability.
    pub fn inspect_wait_graph(&self) -> HashMap<TxId, HashSet<TxId>> {
        self.detector.wait_graph()
    }

    /// Garbage-collects row versions and commit records no live snapshot
    /// can observe. Returns the number of versions dropped.
    pub fn vacuum(&self) -> usize {
        self.txns.vacuum()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            transactions: self.txns.stats(),
            locks: self.locks.metrics(),
            deadlocks: self.detector.stats(),
            validation: self.validator.stats(),
            store: self.store.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::new(EngineConfig {
            lock_timeout: Duration::from_millis(200),
            deadlock_check_interval: Duration::from_millis(5),
            ..EngineConfig::default()
        })
    }

    #[test]
    fn test_engine_instances_are_independent() {
        let a = engine();
        let b = engine();
        a.create_table(TableSchema::new("produit")).unwrap();
        // Same name is free in the other instance.
        b.create_table(TableSchema::new("produit")).unwrap();

        let tx = a.begin(IsolationLevel::ReadCommitted).unwrap();
        a.insert(tx, "produit", &Value::Int(0), row(&[("prix", Value::Int(5))]))
            .unwrap();
        a.commit(tx).unwrap();

        let tx = b.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(b.read(tx, "produit", &Value::Int(0)).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let e = engine();
        e.create_table(TableSchema::new("produit")).unwrap();
        assert!(matches!(
            e.create_table(TableSchema::new("produit")).unwrap_err(),
            Error::TableExists { .. }
        ));
    }

    #[test]
    fn test_inspect_locks_reports_explicit_locks() {
        let e = engine();
        e.create_table(TableSchema::new("produit")).unwrap();
        let tx = e.begin(IsolationLevel::ReadCommitted).unwrap();
        e.insert(tx, "produit", &Value::Int(0), row(&[("prix", Value::Int(5))]))
            .unwrap();
        e.commit(tx).unwrap();

        let tx = e.begin(IsolationLevel::ReadCommitted).unwrap();
        e.select_for_share(tx, "produit", &Value::Int(0)).unwrap();
        let locks = e.inspect_locks("produit");
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].1, LockMode::Shared);
        assert_eq!(locks[0].2, tx);
        e.commit(tx).unwrap();
        assert!(e.inspect_locks("produit").is_empty());
    }

    #[test]
    fn test_transaction_limit() {
        let e = Engine::new(EngineConfig {
            max_active_transactions: 2,
            ..EngineConfig::default()
        });
        let _a = e.begin(IsolationLevel::ReadCommitted).unwrap();
        let _b = e.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(matches!(
            e.begin(IsolationLevel::ReadCommitted).unwrap_err(),
            Error::TransactionLimitReached { limit: 2 }
        ));
    }

    #[test]
    fn test_stats_aggregate() {
        let e = engine();
        e.create_table(TableSchema::new("produit")).unwrap();
        let tx = e.begin(IsolationLevel::ReadCommitted).unwrap();
        e.insert(tx, "produit", &Value::Int(0), row(&[("prix", Value::Int(5))]))
            .unwrap();
        e.commit(tx).unwrap();

        let stats = e.stats();
        assert_eq!(stats.transactions.committed, 1);
        assert!(stats.locks.locks_acquired >= 1);
        assert_eq!(stats.store.rows, 1);
    }
}
