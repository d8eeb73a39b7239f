use crate::deadlock::{DeadlockDetector, TxId};
use crate::error::{Error, Result};
use crate::isolation::{IsolationLevel, LockDuration};
use crate::locks::{LockManager, LockMode, LockResource};
use crate::predicates::Predicate;
use crate::store::TupleStore;
use crate::validation::SerializationValidator;
use crate::value::{Row, Value};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Transaction lifecycle: `Active -> (Blocked <-> Active)* -> terminal`.
/// Terminal states are final; ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Blocked,
    Committed,
    Aborted,
}

#[derive(Debug)]
pub struct Transaction {
    pub id: TxId,
    pub state: TxnState,
    pub level: IsolationLevel,
    /// Snapshot sequence: fixed at begin for RepeatableRead/Serializable,
    /// re-taken per statement for ReadCommitted.
    pub snapshot_seq: u64,
    /// Rows this transaction staged versions for, for commit/abort.
    staged: Vec<(String, Value)>,
}

impl Transaction {
    fn is_terminal(&self) -> bool {
        matches!(self.state, TxnState::Committed | TxnState::Aborted)
    }

    fn note_staged(&mut self, table: &str, key: &Value) {
        let id = (table.to_string(), key.clone());
        if !self.staged.contains(&id) {
            self.staged.push(id);
        }
    }
}

/// Transaction manager statistics.
#[derive(Debug, Clone, Default)]
pub struct TxnStats {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
    pub active: usize,
}

/// Mediates every store access through the isolation policy and the lock
/// manager, and drives commit/abort.
#[derive(Debug)]
pub struct TransactionManager {
    store: Arc<TupleStore>,
    locks: Arc<LockManager>,
    detector: Arc<DeadlockDetector>,
    validator: Arc<SerializationValidator>,
    txns: DashMap<TxId, Arc<RwLock<Transaction>>>,
    next_tx_id: AtomicU64,
    commit_seq: AtomicU64,
    max_active: usize,
    txns_begun: AtomicU64,
    commits_done: AtomicU64,
    aborts_done: AtomicU64,
    commits_since_gc: AtomicU64,
    gc_interval_commits: u64,
}

impl TransactionManager {
    pub fn new(
        store: Arc<TupleStore>,
        locks: Arc<LockManager>,
        detector: Arc<DeadlockDetector>,
        validator: Arc<SerializationValidator>,
        max_active: usize,
        gc_interval_commits: u64,
    ) -> Self {
        Self {
            store,
            locks,
            detector,
            validator,
            txns: DashMap::new(),
            next_tx_id: AtomicU64::new(1),
            commit_seq: AtomicU64::new(0),
            max_active,
            txns_begun: AtomicU64::new(0),
            commits_done: AtomicU64::new(0),
            aborts_done: AtomicU64::new(0),
            commits_since_gc: AtomicU64::new(0),
            gc_interval_commits,
        }
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<TxId> {
        if self.active_count() >= self.max_active {
            return Err(Error::TransactionLimitReached {
                limit: self.max_active,
            });
        }
        let tx_id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let snapshot_seq = self.commit_seq.load(Ordering::SeqCst);
        self.detector.register_transaction(tx_id);
        if level.validates_at_commit() {
            self.validator.begin_tracking(tx_id);
        }
        self.txns.insert(
            tx_id,
            Arc::new(RwLock::new(Transaction {
                id: tx_id,
                state: TxnState::Active,
                level,
                snapshot_seq,
                staged: Vec::new(),
            })),
        );
        self.txns_begun.fetch_add(1, Ordering::Relaxed);
        info!("began tx {} at {} (snapshot {})", tx_id, level, snapshot_seq);
        Ok(tx_id)
    }

    /// Reads one row. ReadCommitted takes a statement-scoped Shared lock,
    /// RepeatableRead holds Shared to commit, Serializable records the read
    /// in its read-set instead of locking.
    pub fn read(&self, tx_id: TxId, table: &str, key: &Value) -> Result<Option<Row>> {
        self.ensure_table(table)?;
        let (level, snapshot) = self.statement_begin(tx_id)?;
        let resource = LockResource::Row {
            table: table.to_string(),
            key: key.clone(),
        };
        match level.read_lock_duration() {
            LockDuration::Statement => {
                // A lock already held to commit (prior write, FOR SHARE)
                // must survive the statement-scoped release below.
                let already_held = self.locks.holds(tx_id, &resource, LockMode::Shared);
                self.blocking_acquire(tx_id, resource.clone(), LockMode::Shared, &[])?;
                // The wait may have spanned a commit; re-take the statement
                // snapshot so the read observes what the lock holder wrote.
                let snapshot = self.commit_seq.load(Ordering::SeqCst);
                let result = self.store.read(table, key, tx_id, snapshot);
                if !already_held {
                    self.locks.release_statement_locks(tx_id, &[resource]);
                }
                result
            }
            LockDuration::Commit => {
                self.blocking_acquire(tx_id, resource, LockMode::Shared, &[])?;
                self.store.read(table, key, tx_id, snapshot)
            }
            LockDuration::None => {
                self.validator.record_read(tx_id, table, key);
                self.store.read(table, key, tx_id, snapshot)
            }
        }
    }

    /// Merges `updates` into the current image of the row under an
    /// Exclusive lock held to commit. The write base is the latest
    /// committed image (plus this transaction's own staged changes); the
    /// snapshot governs reads only.
    pub fn write(&self, tx_id: TxId, table: &str, key: &Value, updates: Row) -> Result<()> {
        self.ensure_table(table)?;
        let (level, _) = self.statement_begin(tx_id)?;

        // Peek the current image for value-precise predicate conflicts.
        let current_seq = self.commit_seq.load(Ordering::SeqCst);
        let old = self.store.read(table, key, tx_id, current_seq)?;
        let mut new = old.clone().unwrap_or_default();
        for (col, v) in &updates {
            new.insert(col.clone(), v.clone());
        }
        let resource = LockResource::Row {
            table: table.to_string(),
            key: key.clone(),
        };
        let images: Vec<&Row> = match &old {
            Some(o) => vec![o, &new],
            None => vec![&new],
        };
        self.blocking_acquire(tx_id, resource, LockMode::Exclusive, &images)?;

        // Re-read under the lock: the row may have changed (or vanished)
        // while we waited.
        let current_seq = self.commit_seq.load(Ordering::SeqCst);
        let base = self
            .store
            .read(table, key, tx_id, current_seq)?
            .ok_or_else(|| Error::RowNotFound {
                table: table.to_string(),
            })?;
        let mut merged = base;
        for (col, v) in updates {
            merged.insert(col, v);
        }

        if level.validates_at_commit() {
            self.validator.record_read(tx_id, table, key);
            self.validator.record_write(tx_id, table, key);
        }
        self.store.stage_write(table, key, merged, tx_id)?;
        self.with_txn_mut(tx_id, |tx| tx.note_staged(table, key))?;
        Ok(())
    }

    /// Inserts a new row. Child-side foreign keys take a Shared lock on the
    /// parent row (held to commit) and verify the parent exists.
    pub fn insert(&self, tx_id: TxId, table: &str, key: &Value, values: Row) -> Result<()> {
        self.ensure_table(table)?;
        let (level, _) = self.statement_begin(tx_id)?;

        for fk in self.store.foreign_keys_of(table)? {
            let parent_key = match values.get(&fk.column) {
                Some(Value::Null) | None => continue,
                Some(v) => v.clone(),
            };
            let parent_resource = LockResource::Row {
                table: fk.parent_table.clone(),
                key: parent_key.clone(),
            };
            self.blocking_acquire(tx_id, parent_resource, LockMode::Shared, &[])?;
            let current_seq = self.commit_seq.load(Ordering::SeqCst);
            let parent = self
                .store
                .read(&fk.parent_table, &parent_key, tx_id, current_seq)?;
            if parent.is_none() {
                return Err(Error::ForeignKeyViolation {
                    table: table.to_string(),
                    column: fk.column.clone(),
                    parent_table: fk.parent_table.clone(),
                });
            }
        }

        let resource = LockResource::Row {
            table: table.to_string(),
            key: key.clone(),
        };
        self.blocking_acquire(tx_id, resource, LockMode::Exclusive, &[&values])?;

        if self.store.current_exists(table, key)? {
            return Err(Error::DuplicateKey {
                table: table.to_string(),
            });
        }
        if level.validates_at_commit() {
            self.validator.record_write(tx_id, table, key);
        }
        self.store.stage_write(table, key, values, tx_id)?;
        self.with_txn_mut(tx_id, |tx| tx.note_staged(table, key))?;
        Ok(())
    }

    /// Deletes a row. Parent-side foreign keys take a Shared predicate lock
    /// over the referencing column in each child table, then fail with
    /// `ForeignKeyViolation` if a visible referencing row exists.
    pub fn delete(&self, tx_id: TxId, table: &str, key: &Value) -> Result<()> {
        self.ensure_table(table)?;
        let (level, _) = self.statement_begin(tx_id)?;

        let current_seq = self.commit_seq.load(Ordering::SeqCst);
        let old = self.store.read(table, key, tx_id, current_seq)?;
        let resource = LockResource::Row {
            table: table.to_string(),
            key: key.clone(),
        };
        let images: Vec<&Row> = old.iter().collect();
        self.blocking_acquire(tx_id, resource, LockMode::Exclusive, &images)?;

        let current_seq = self.commit_seq.load(Ordering::SeqCst);
        let prior = self
            .store
            .read(table, key, tx_id, current_seq)?
            .ok_or_else(|| Error::RowNotFound {
                table: table.to_string(),
            })?;

        for (child_table, column) in self.store.referencing_tables(table) {
            let child_pred = LockResource::Predicate {
                table: child_table.clone(),
                predicate: Predicate::column_eq(column.clone(), key.clone()),
            };
            self.blocking_acquire(tx_id, child_pred, LockMode::Shared, &[])?;
            let current_seq = self.commit_seq.load(Ordering::SeqCst);
            if self
                .store
                .has_reference(&child_table, &column, key, tx_id, current_seq)?
            {
                return Err(Error::ForeignKeyViolation {
                    table: child_table,
                    column,
                    parent_table: table.to_string(),
                });
            }
        }

        if level.validates_at_commit() {
            self.validator.record_read(tx_id, table, key);
            self.validator.record_write(tx_id, table, key);
        }
        self.store.stage_delete(table, key, prior, tx_id)?;
        self.with_txn_mut(tx_id, |tx| tx.note_staged(table, key))?;
        Ok(())
    }

    /// Snapshot scan. Plain scans take no locks: the snapshot provides
    /// statement (ReadCommitted) or transaction (RepeatableRead) level
    /// consistency, and Serializable records the predicate for commit-time
    /// phantom validation. Explicit range locking goes through
    /// [`scan_locked`](Self::scan_locked).
    pub fn scan(
        &self,
        tx_id: TxId,
        table: &str,
        predicate: &Predicate,
    ) -> Result<Vec<(Value, Row)>> {
        self.ensure_table(table)?;
        let (level, snapshot) = self.statement_begin(tx_id)?;
        if level.validates_at_commit() {
            self.validator.record_scan(tx_id, table, predicate);
        }
        self.store.scan(table, predicate, tx_id, snapshot)
    }

    /// `SELECT ... FOR SHARE/FOR UPDATE` on a single row: the lock maps
    /// directly to Shared/Exclusive, held to commit regardless of level,
    /// and the read returns the current committed image.
    pub fn select_locked(
        &self,
        tx_id: TxId,
        table: &str,
        key: &Value,
        mode: LockMode,
    ) -> Result<Option<Row>> {
        self.ensure_table(table)?;
        let (level, _) = self.statement_begin(tx_id)?;
        let resource = LockResource::Row {
            table: table.to_string(),
            key: key.clone(),
        };
        self.blocking_acquire(tx_id, resource, mode, &[])?;
        if level.validates_at_commit() {
            self.validator.record_read(tx_id, table, key);
        }
        let current_seq = self.commit_seq.load(Ordering::SeqCst);
        self.store.read(table, key, tx_id, current_seq)
    }

    /// Range `FOR SHARE/FOR UPDATE`: takes a predicate lock held to commit
    /// (closing the phantom gap pessimistically) and returns the current
    /// committed matches.
    pub fn scan_locked(
        &self,
        tx_id: TxId,
        table: &str,
        predicate: &Predicate,
        mode: LockMode,
    ) -> Result<Vec<(Value, Row)>> {
        self.ensure_table(table)?;
        let (level, _) = self.statement_begin(tx_id)?;
        let resource = LockResource::Predicate {
            table: table.to_string(),
            predicate: predicate.clone(),
        };
        self.blocking_acquire(tx_id, resource, mode, &[])?;
        if level.validates_at_commit() {
            self.validator.record_scan(tx_id, table, predicate);
        }
        let current_seq = self.commit_seq.load(Ordering::SeqCst);
        self.store.scan(table, predicate, tx_id, current_seq)
    }

    /// `LOCK TABLE ... IN SHARE/EXCLUSIVE MODE`.
    pub fn lock_table(&self, tx_id: TxId, table: &str, mode: LockMode) -> Result<()> {
        self.ensure_table(table)?;
        self.statement_begin(tx_id)?;
        self.blocking_acquire(tx_id, LockResource::Table(table.to_string()), mode, &[])
    }

    /// Commits. Pessimistic levels always succeed once their locks are
    /// held; Serializable first validates against transactions committed
    /// after its snapshot and aborts with `SerializationFailure` on
    /// conflict.
    pub fn commit(&self, tx_id: TxId) -> Result<()> {
        let txn = self.txn(tx_id)?;
        let (level, snapshot_seq, staged) = {
            let tx = txn.read();
            if tx.is_terminal() {
                return Err(Error::protocol(format!(
                    "commit of tx {} in terminal state {:?}",
                    tx_id, tx.state
                )));
            }
            (tx.level, tx.snapshot_seq, tx.staged.clone())
        };

        {
            let _commit_guard = self.validator.lock_commits();
            if level.validates_at_commit() {
                if let Err(err) = self.validator.validate(tx_id, snapshot_seq) {
                    drop(_commit_guard);
                    debug!("tx {} failed validation, aborting", tx_id);
                    self.finalize_abort(tx_id)?;
                    return Err(err);
                }
            }
            let commit_seq = self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let writes = self.store.commit_transaction(tx_id, &staged, commit_seq);
            self.validator.publish(tx_id, commit_seq, writes);
            txn.write().state = TxnState::Committed;
            info!("committed tx {} at seq {}", tx_id, commit_seq);
        }

        self.locks.release_all(tx_id);
        self.detector.unregister_transaction(tx_id);
        self.validator.forget(tx_id);
        self.commits_done.fetch_add(1, Ordering::Relaxed);
        self.maybe_gc();
        Ok(())
    }

    /// Aborts. Idempotent for already-aborted transactions (the deadlock
    /// victim and rollback paths); aborting a committed transaction is a
    /// protocol violation.
    pub fn abort(&self, tx_id: TxId) -> Result<()> {
        let txn = self.txn(tx_id)?;
        {
            let tx = txn.read();
            match tx.state {
                TxnState::Aborted => return Ok(()),
                TxnState::Committed => {
                    return Err(Error::protocol(format!(
                        "abort of committed tx {}",
                        tx_id
                    )));
                }
                _ => {}
            }
        }
        self.finalize_abort(tx_id)
    }

    pub fn state_of(&self, tx_id: TxId) -> Result<TxnState> {
        Ok(self.txn(tx_id)?.read().state)
    }

    /// Oldest snapshot any live transaction may still read from; the GC
    /// horizon when no transaction is live.
    pub fn oldest_active_snapshot(&self) -> u64 {
        self.txns
            .iter()
            .filter_map(|entry| {
                let tx = entry.value().read();
                match tx.state {
                    TxnState::Active | TxnState::Blocked => Some(tx.snapshot_seq),
                    _ => None,
                }
            })
            .min()
            .unwrap_or_else(|| self.commit_seq.load(Ordering::SeqCst))
    }

    /// Garbage-collects row versions and commit records no live snapshot
    /// can observe, and drops terminal transaction entries.
    pub fn vacuum(&self) -> usize {
        let horizon = self.oldest_active_snapshot();
        let dropped = self.store.vacuum(horizon);
        self.validator.prune(horizon);
        self.txns.retain(|_, txn| !txn.read().is_terminal());
        dropped
    }

    pub fn stats(&self) -> TxnStats {
        TxnStats {
            begun: self.txns_begun.load(Ordering::Relaxed),
            committed: self.commits_done.load(Ordering::Relaxed),
            aborted: self.aborts_done.load(Ordering::Relaxed),
            active: self.active_count(),
        }
    }

    fn txn(&self, tx_id: TxId) -> Result<Arc<RwLock<Transaction>>> {
        self.txns
            .get(&tx_id)
            .map(|e| e.value().clone())
            .ok_or(Error::TransactionNotFound { id: tx_id })
    }

    fn with_txn_mut(&self, tx_id: TxId, f: impl FnOnce(&mut Transaction)) -> Result<()> {
        let txn = self.txn(tx_id)?;
        let mut tx = txn.write();
        f(&mut tx);
        Ok(())
    }

    fn active_count(&self) -> usize {
        self.txns
            .iter()
            .filter(|e| !e.value().read().is_terminal())
            .count()
    }

    fn ensure_table(&self, table: &str) -> Result<()> {
        if !self.store.table_exists(table) {
            return Err(Error::TableNotFound {
                name: table.to_string(),
            });
        }
        Ok(())
    }

    /// Statement prologue: rejects terminal transactions and refreshes the
    /// snapshot for statement-snapshot levels.
    fn statement_begin(&self, tx_id: TxId) -> Result<(IsolationLevel, u64)> {
        let txn = self.txn(tx_id)?;
        let mut tx = txn.write();
        if tx.is_terminal() {
            return Err(Error::protocol(format!(
                "operation on tx {} in terminal state {:?}",
                tx_id, tx.state
            )));
        }
        if tx.level.snapshot_per_statement() {
            tx.snapshot_seq = self.commit_seq.load(Ordering::SeqCst);
        }
        Ok((tx.level, tx.snapshot_seq))
    }

    /// Runs a lock acquisition with BLOCKED state bookkeeping. A
    /// `DeadlockAborted` return finalizes the abort before propagating.
    fn blocking_acquire(
        &self,
        tx_id: TxId,
        resource: LockResource,
        mode: LockMode,
        images: &[&Row],
    ) -> Result<()> {
        self.set_state(tx_id, TxnState::Blocked);
        let result = self
            .locks
            .acquire_with_images(tx_id, resource, mode, images);
        match &result {
            Err(Error::DeadlockAborted { .. }) => {
                self.finalize_abort(tx_id)?;
            }
            _ => self.set_state(tx_id, TxnState::Active),
        }
        result
    }

    fn set_state(&self, tx_id: TxId, state: TxnState) {
        if let Ok(txn) = self.txn(tx_id) {
            let mut tx = txn.write();
            if !tx.is_terminal() {
                tx.state = state;
            }
        }
    }

    /// Tears a transaction down exactly once: discards staged versions,
    /// releases all locks, and clears detector/validator state. Safe to
    /// call after a victim teardown already released the locks.
    fn finalize_abort(&self, tx_id: TxId) -> Result<()> {
        let txn = self.txn(tx_id)?;
        let staged = {
            let mut tx = txn.write();
            if tx.state == TxnState::Aborted {
                return Ok(());
            }
            tx.state = TxnState::Aborted;
            std::mem::take(&mut tx.staged)
        };
        self.store.abort_transaction(tx_id, &staged);
        self.locks.release_all(tx_id);
        self.detector.unregister_transaction(tx_id);
        self.validator.forget(tx_id);
        self.locks.clear_doomed(tx_id);
        self.aborts_done.fetch_add(1, Ordering::Relaxed);
        info!("aborted tx {}", tx_id);
        Ok(())
    }

    fn maybe_gc(&self) {
        let n = self.commits_since_gc.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= self.gc_interval_commits {
            self.commits_since_gc.store(0, Ordering::Relaxed);
            self.vacuum();
        }
    }
}
