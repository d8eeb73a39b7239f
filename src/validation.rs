use crate::deadlock::TxId;
use crate::error::{Error, Result};
use crate::predicates::Predicate;
use crate::store::CommittedWrite;
use crate::value::Value;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// What a serializable transaction touched, for backward validation.
#[derive(Debug, Default)]
struct AccessSets {
    read_keys: HashSet<(String, Value)>,
    scanned: Vec<(String, Predicate)>,
    write_keys: HashSet<(String, Value)>,
}

/// The writes one transaction published, ordered by commit sequence in the log.
#[derive(Debug, Clone)]
struct CommitRecord {
    tx_id: TxId,
    commit_seq: u64,
    writes: Vec<CommittedWrite>,
}

/// Validator statistics.
#[derive(Debug, Clone, Default)]
pub struct ValidationStats {
    pub validations_passed: u64,
    pub validations_failed: u64,
    pub tracked_transactions: usize,
    pub log_records: usize,
    pub records_pruned: u64,
}

/// Commit-time validation for Serializable transactions.
///
/// Reads and scans are tracked instead of locked; at commit the transaction
/// is checked against every transaction that committed after its snapshot.
/// A conflict exists when such a commit wrote a key this transaction read
/// or wrote, or a row matching a predicate it scanned.
#[derive(Debug)]
pub struct SerializationValidator {
    tracked: RwLock<HashMap<TxId, AccessSets>>,
    commit_log: RwLock<Vec<CommitRecord>>,
    commit_guard: Mutex<()>,
    stats: RwLock<ValidationStats>,
}

impl SerializationValidator {
    pub fn new() -> Self {
        Self {
            tracked: RwLock::new(HashMap::new()),
            commit_log: RwLock::new(Vec::new()),
            commit_guard: Mutex::new(()),
            stats: RwLock::new(ValidationStats::default()),
        }
    }

    /// Starts read/write-set tracking for a serializable transaction.
    pub fn begin_tracking(&self, tx_id: TxId) {
        self.tracked.write().insert(tx_id, AccessSets::default());
        debug!("validation tracking started for tx {}", tx_id);
    }

    pub fn is_tracked(&self, tx_id: TxId) -> bool {
        self.tracked.read().contains_key(&tx_id)
    }

    pub fn record_read(&self, tx_id: TxId, table: &str, key: &Value) {
        if let Some(sets) = self.tracked.write().get_mut(&tx_id) {
            sets.read_keys.insert((table.to_string(), key.clone()));
        }
    }

    pub fn record_scan(&self, tx_id: TxId, table: &str, predicate: &Predicate) {
        if let Some(sets) = self.tracked.write().get_mut(&tx_id) {
            sets.scanned.push((table.to_string(), predicate.clone()));
        }
    }

    pub fn record_write(&self, tx_id: TxId, table: &str, key: &Value) {
        if let Some(sets) = self.tracked.write().get_mut(&tx_id) {
            sets.write_keys.insert((table.to_string(), key.clone()));
        }
    }

    /// Drops all tracking state for a finished transaction.
    pub fn forget(&self, tx_id: TxId) {
        self.tracked.write().remove(&tx_id);
    }

    /// Serializes validate-and-publish sections across committers so the
    /// log order matches commit-sequence order.
    pub(crate) fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_guard.lock()
    }

    /// Checks `tx_id` (snapshot at `snapshot_seq`) against everything
    /// committed after that snapshot. Caller holds the commit guard.
    pub fn validate(&self, tx_id: TxId, snapshot_seq: u64) -> Result<()> {
        let tracked = self.tracked.read();
        let Some(sets) = tracked.get(&tx_id) else {
            return Ok(());
        };
        let log = self.commit_log.read();
        for record in log.iter().rev() {
            if record.commit_seq <= snapshot_seq {
                break;
            }
            if record.tx_id == tx_id {
                continue;
            }
            for write in &record.writes {
                let key_id = (write.table.clone(), write.key.clone());
                if sets.read_keys.contains(&key_id) {
                    trace!(
                        "tx {} read {}({}) overwritten by tx {}",
                        tx_id,
                        write.table,
                        write.key,
                        record.tx_id
                    );
                    return self.fail(tx_id, record.tx_id);
                }
                if sets.write_keys.contains(&key_id) {
                    trace!(
                        "tx {} write {}({}) collides with tx {}",
                        tx_id,
                        write.table,
                        write.key,
                        record.tx_id
                    );
                    return self.fail(tx_id, record.tx_id);
                }
                for (table, predicate) in &sets.scanned {
                    if *table == write.table && predicate.matches_row(&write.key, &write.values) {
                        trace!(
                            "tx {} scanned {} where {}, phantom from tx {}",
                            tx_id,
                            table,
                            predicate,
                            record.tx_id
                        );
                        return self.fail(tx_id, record.tx_id);
                    }
                }
            }
        }
        self.stats.write().validations_passed += 1;
        Ok(())
    }

    /// Appends a committed transaction's writes to the log. Caller holds the
    /// commit guard; sequences are appended in increasing order.
    pub fn publish(&self, tx_id: TxId, commit_seq: u64, writes: Vec<CommittedWrite>) {
        if writes.is_empty() {
            return;
        }
        let mut log = self.commit_log.write();
        debug_assert!(log.last().map(|r| r.commit_seq < commit_seq).unwrap_or(true));
        log.push(CommitRecord {
            tx_id,
            commit_seq,
            writes,
        });
    }

    /// Drops log records no tracked transaction can conflict with.
    pub fn prune(&self, oldest_snapshot: u64) -> usize {
        let mut log = self.commit_log.write();
        let before = log.len();
        log.retain(|r| r.commit_seq > oldest_snapshot);
        let pruned = before - log.len();
        if pruned > 0 {
            self.stats.write().records_pruned += pruned as u64;
            debug!("pruned {} commit record(s)", pruned);
        }
        pruned
    }

    pub fn stats(&self) -> ValidationStats {
        let mut stats = self.stats.read().clone();
        stats.tracked_transactions = self.tracked.read().len();
        stats.log_records = self.commit_log.read().len();
        stats
    }

    fn fail(&self, tx_id: TxId, conflicting_tx: TxId) -> Result<()> {
        self.stats.write().validations_failed += 1;
        Err(Error::SerializationFailure {
            tx_id,
            conflicting_tx,
        })
    }
}

impl Default for SerializationValidator {
    fn default() -> Self {
        Self::new()
    }
}
