use crate::deadlock::TxId;
use crate::error::{Error, Result};
use crate::predicates::Predicate;
use crate::value::{Row, Value};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// A referential constraint: `column` of this table holds a primary key of
/// `parent_table`.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub column: String,
    pub parent_table: String,
}

/// Table metadata the core needs: identity plus foreign-key constraints.
/// Column sets are the execution layer's business.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        parent_table: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            parent_table: parent_table.into(),
        });
        self
    }
}

/// One version of a row. `commit_seq` is `None` while the creating
/// transaction is still active; tombstones keep the prior image in `values`
/// so predicate checks can still match the deleted row.
#[derive(Debug, Clone)]
pub struct RowVersion {
    pub values: Row,
    pub created_by: TxId,
    pub commit_seq: Option<u64>,
    pub deleted: bool,
}

/// A write published at commit, fed to serializable validation.
#[derive(Debug, Clone)]
pub struct CommittedWrite {
    pub table: String,
    pub key: Value,
    pub values: Row,
    pub deleted: bool,
}

// Rows almost always carry one committed version plus at most one staged one.
type VersionChain = SmallVec<[RowVersion; 2]>;

#[derive(Debug)]
struct Table {
    schema: TableSchema,
    rows: BTreeMap<Value, VersionChain>,
}

/// Store statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub tables: usize,
    pub rows: usize,
    pub versions: usize,
    pub versions_gced: u64,
}

/// In-memory tuple store with per-row version chains.
///
/// The store itself does no locking of transactions: callers mutate a row
/// only while holding the corresponding Exclusive lock (or as a validated
/// serializable committer), which is the invariant that keeps disjoint
/// rows safely parallel.
#[derive(Debug)]
pub struct TupleStore {
    tables: RwLock<HashMap<String, Table>>,
    versions_gced: AtomicU64,
}

impl TupleStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            versions_gced: AtomicU64::new(0),
        }
    }

    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(&schema.name) {
            return Err(Error::TableExists {
                name: schema.name.clone(),
            });
        }
        debug!("created table {}", schema.name);
        tables.insert(
            schema.name.clone(),
            Table {
                schema,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    /// Foreign keys declared on `table`.
    pub fn foreign_keys_of(&self, table: &str) -> Result<Vec<ForeignKey>> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| Error::TableNotFound {
            name: table.to_string(),
        })?;
        Ok(t.schema.foreign_keys.clone())
    }

    /// `(child_table, column)` pairs referencing `parent_table`.
    pub fn referencing_tables(&self, parent_table: &str) -> Vec<(String, String)> {
        let tables = self.tables.read();
        tables
            .values()
            .flat_map(|t| {
                t.schema
                    .foreign_keys
                    .iter()
                    .filter(|fk| fk.parent_table == parent_table)
                    .map(|fk| (t.schema.name.clone(), fk.column.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Row image visible to `observer` at `snapshot` (its own staged writes
    /// first, then the newest version committed at or before the snapshot).
    pub fn read(
        &self,
        table: &str,
        key: &Value,
        observer: TxId,
        snapshot: u64,
    ) -> Result<Option<Row>> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| Error::TableNotFound {
            name: table.to_string(),
        })?;
        Ok(t.rows
            .get(key)
            .and_then(|chain| visible_version(chain, observer, snapshot))
            .filter(|v| !v.deleted)
            .map(|v| v.values.clone()))
    }

    /// Visible rows matching `predicate`, in key order.
    pub fn scan(
        &self,
        table: &str,
        predicate: &Predicate,
        observer: TxId,
        snapshot: u64,
    ) -> Result<Vec<(Value, Row)>> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| Error::TableNotFound {
            name: table.to_string(),
        })?;
        let mut out = Vec::new();
        for (key, chain) in &t.rows {
            if !predicate.matches_key(key) {
                continue;
            }
            if let Some(v) = visible_version(chain, observer, snapshot) {
                if !v.deleted && predicate.matches_row(key, &v.values) {
                    out.push((key.clone(), v.values.clone()));
                }
            }
        }
        trace!(
            "scan {} where {}: {} row(s) at snapshot {}",
            table,
            predicate,
            out.len(),
            snapshot
        );
        Ok(out)
    }

    /// Whether any visible row of `table` holds `parent_key` in `column`.
    pub fn has_reference(
        &self,
        table: &str,
        column: &str,
        parent_key: &Value,
        observer: TxId,
        snapshot: u64,
    ) -> Result<bool> {
        let matches = self.scan(
            table,
            &Predicate::column_eq(column, parent_key.clone()),
            observer,
            snapshot,
        )?;
        Ok(!matches.is_empty())
    }

    /// Whether the latest version of the row (committed or staged by anyone)
    /// is live. Duplicate-key checks go against the current state, not the
    /// observer's snapshot.
    pub fn current_exists(&self, table: &str, key: &Value) -> Result<bool> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| Error::TableNotFound {
            name: table.to_string(),
        })?;
        let Some(chain) = t.rows.get(key) else {
            return Ok(false);
        };
        let latest = chain
            .iter()
            .rev()
            .find(|v| v.commit_seq.is_none())
            .or_else(|| {
                chain
                    .iter()
                    .filter(|v| v.commit_seq.is_some())
                    .max_by_key(|v| v.commit_seq)
            });
        Ok(latest.map(|v| !v.deleted).unwrap_or(false))
    }

    /// Stages an uncommitted row image for `tx_id`, replacing any image it
    /// already staged on the same row.
    pub fn stage_write(&self, table: &str, key: &Value, values: Row, tx_id: TxId) -> Result<()> {
        self.stage(table, key, values, tx_id, false)
    }

    /// Stages a tombstone carrying the prior row image.
    pub fn stage_delete(
        &self,
        table: &str,
        key: &Value,
        prior_values: Row,
        tx_id: TxId,
    ) -> Result<()> {
        self.stage(table, key, prior_values, tx_id, true)
    }

    fn stage(&self, table: &str, key: &Value, values: Row, tx_id: TxId, deleted: bool) -> Result<()> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| Error::TableNotFound {
            name: table.to_string(),
        })?;
        let chain = t.rows.entry(key.clone()).or_default();
        chain.retain(|v| !(v.commit_seq.is_none() && v.created_by == tx_id));
        chain.push(RowVersion {
            values,
            created_by: tx_id,
            commit_seq: None,
            deleted,
        });
        trace!(
            "staged {} {}({}) for tx {}",
            if deleted { "delete" } else { "write" },
            table,
            key,
            tx_id
        );
        Ok(())
    }

    /// Stamps every version staged by `tx_id` with `commit_seq`, publishing
    /// them to later snapshots. Returns the published writes.
    pub fn commit_transaction(
        &self,
        tx_id: TxId,
        staged: &[(String, Value)],
        commit_seq: u64,
    ) -> Vec<CommittedWrite> {
        let mut tables = self.tables.write();
        let mut published = Vec::new();
        for (table, key) in staged {
            let Some(t) = tables.get_mut(table) else {
                continue;
            };
            let Some(chain) = t.rows.get_mut(key) else {
                continue;
            };
            if let Some(v) = chain
                .iter_mut()
                .find(|v| v.commit_seq.is_none() && v.created_by == tx_id)
            {
                v.commit_seq = Some(commit_seq);
                published.push(CommittedWrite {
                    table: table.clone(),
                    key: key.clone(),
                    values: v.values.clone(),
                    deleted: v.deleted,
                });
            }
        }
        debug!(
            "tx {} published {} version(s) at commit seq {}",
            tx_id,
            published.len(),
            commit_seq
        );
        published
    }

    /// Discards every version staged by `tx_id`.
    pub fn abort_transaction(&self, tx_id: TxId, staged: &[(String, Value)]) {
        let mut tables = self.tables.write();
        let mut discarded = 0usize;
        for (table, key) in staged {
            let Some(t) = tables.get_mut(table) else {
                continue;
            };
            let now_empty = match t.rows.get_mut(key) {
                Some(chain) => {
                    let before = chain.len();
                    chain.retain(|v| !(v.commit_seq.is_none() && v.created_by == tx_id));
                    discarded += before - chain.len();
                    chain.is_empty()
                }
                None => false,
            };
            if now_empty {
                t.rows.remove(key);
            }
        }
        if discarded > 0 {
            debug!("tx {} discarded {} staged version(s)", tx_id, discarded);
        }
    }

    /// Garbage-collects versions no active snapshot can observe: anything
    /// superseded by a version committed at or before `oldest_snapshot`,
    /// and fully-deleted chains. Returns the number of versions dropped.
    pub fn vacuum(&self, oldest_snapshot: u64) -> usize {
        let mut tables = self.tables.write();
        let mut dropped = 0usize;
        for t in tables.values_mut() {
            let mut emptied = Vec::new();
            for (key, chain) in t.rows.iter_mut() {
                let horizon = chain
                    .iter()
                    .filter_map(|v| v.commit_seq)
                    .filter(|&s| s <= oldest_snapshot)
                    .max();
                let Some(horizon) = horizon else { continue };
                let before = chain.len();
                chain.retain(|v| match v.commit_seq {
                    // Superseded before every live snapshot.
                    Some(s) if s < horizon => false,
                    // A tombstone at the horizon reads the same as an
                    // absent chain once its predecessors are gone.
                    Some(s) if s == horizon => !v.deleted,
                    _ => true,
                });
                dropped += before - chain.len();
                if chain.is_empty() {
                    emptied.push(key.clone());
                }
            }
            for key in emptied {
                t.rows.remove(&key);
            }
        }
        if dropped > 0 {
            self.versions_gced.fetch_add(dropped as u64, Ordering::Relaxed);
            debug!("vacuum dropped {} version(s)", dropped);
        }
        dropped
    }

    pub fn stats(&self) -> StoreStats {
        let tables = self.tables.read();
        StoreStats {
            tables: tables.len(),
            rows: tables.values().map(|t| t.rows.len()).sum(),
            versions: tables
                .values()
                .map(|t| t.rows.values().map(|c| c.len()).sum::<usize>())
                .sum(),
            versions_gced: self.versions_gced.load(Ordering::Relaxed),
        }
    }
}

impl Default for TupleStore {
    fn default() -> Self {
        Self::new()
    }
}

fn visible_version<'a>(chain: &'a [RowVersion], observer: TxId, snapshot: u64) -> Option<&'a RowVersion> {
    chain
        .iter()
        .rev()
        .find(|v| v.commit_seq.is_none() && v.created_by == observer)
        .or_else(|| {
            chain
                .iter()
                .filter(|v| v.commit_seq.map(|s| s <= snapshot).unwrap_or(false))
                .max_by_key(|v| v.commit_seq)
        })
}
