use crate::deadlock::{DeadlockDetector, TxId, Victim};
use crate::error::{Error, Result};
use crate::predicates::Predicate;
use crate::value::{Row, Value};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lock modes. Shared coexists with Shared; Exclusive with nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "SHARED"),
            LockMode::Exclusive => write!(f, "EXCLUSIVE"),
        }
    }
}

/// A lockable resource: a whole table, a single row, or a predicate range
/// over a table (phantom prevention).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockResource {
    Table(String),
    Row { table: String, key: Value },
    Predicate { table: String, predicate: Predicate },
}

impl LockResource {
    pub fn table_name(&self) -> &str {
        match self {
            LockResource::Table(t) => t,
            LockResource::Row { table, .. } => table,
            LockResource::Predicate { table, .. } => table,
        }
    }
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockResource::Table(t) => write!(f, "table {}", t),
            LockResource::Row { table, key } => write!(f, "{}({})", table, key),
            LockResource::Predicate { table, predicate } => {
                write!(f, "{} where {}", table, predicate)
            }
        }
    }
}

/// Whether two distinct resources in the same table can cover a common row.
/// `images` are the row images the requester is about to touch (old and new
/// for an update); with them, conflicts against column-predicate locks are
/// value-precise. Without them the check is conservative.
fn resources_overlap(requested: &LockResource, images: &[&Row], held: &LockResource) -> bool {
    if requested.table_name() != held.table_name() {
        return false;
    }
    match (requested, held) {
        (LockResource::Table(_), _) | (_, LockResource::Table(_)) => true,
        (LockResource::Row { key: a, .. }, LockResource::Row { key: b, .. }) => a == b,
        (LockResource::Row { key, .. }, LockResource::Predicate { predicate, .. }) => {
            if images.is_empty() {
                predicate.matches_key(key)
            } else {
                images.iter().any(|img| predicate.matches_row(key, img))
            }
        }
        (LockResource::Predicate { predicate, .. }, LockResource::Row { key, .. }) => {
            predicate.matches_key(key)
        }
        (
            LockResource::Predicate { predicate: a, .. },
            LockResource::Predicate { predicate: b, .. },
        ) => a.overlaps(b),
    }
}

#[derive(Debug, Clone)]
struct LockRequest {
    tx_id: TxId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct LockEntry {
    requests: VecDeque<LockRequest>,
}

impl LockEntry {
    fn granted_mode(&self, tx_id: TxId) -> Option<LockMode> {
        self.requests
            .iter()
            .filter(|r| r.granted && r.tx_id == tx_id)
            .map(|r| r.mode)
            .max()
    }

    fn first_ungranted(&self) -> Option<TxId> {
        self.requests.iter().find(|r| !r.granted).map(|r| r.tx_id)
    }
}

#[derive(Debug, Default)]
struct LockTable {
    entries: HashMap<LockResource, LockEntry>,
}

/// Lock manager metrics.
#[derive(Debug, Clone, Default)]
pub struct LockMetrics {
    pub locks_acquired: u64,
    pub locks_released: u64,
    pub upgrades: u64,
    pub conflicts: u64,
    pub timeouts: u64,
    pub deadlock_victims: u64,
}

enum TryAcquire {
    Satisfied,
    Granted,
    MustWait,
}

/// Strict two-phase lock manager.
///
/// All grant and release decisions are made under one table-wide mutex so
/// that cross-resource conflicts (a table lock covering rows, a predicate
/// lock covering matching rows) are never decided on a torn view. Blocked
/// requests wait in a poll loop outside the mutex until granted, timed out,
/// or aborted as a deadlock victim.
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
    /// Granted resources per transaction, for exactly-once release.
    tx_locks: DashMap<TxId, HashSet<LockResource>>,
    /// The resource each blocked transaction is queued on.
    waiting: DashMap<TxId, LockResource>,
    /// Deadlock victims whose locks were already torn down; their blocked
    /// call surfaces `DeadlockAborted` on its next wakeup.
    doomed: DashMap<TxId, ()>,
    detector: Arc<DeadlockDetector>,
    lock_timeout: Duration,
    poll_interval: Duration,
    metrics: Mutex<LockMetrics>,
}

impl LockManager {
    pub fn new(detector: Arc<DeadlockDetector>, lock_timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            tx_locks: DashMap::new(),
            waiting: DashMap::new(),
            doomed: DashMap::new(),
            detector,
            lock_timeout,
            poll_interval: Duration::from_millis(2),
            metrics: Mutex::new(LockMetrics::default()),
        }
    }

    /// Acquires `mode` on `resource` for `tx_id`, blocking while conflicting
    /// locks are held. Errors: `LockTimeout` after the configured bound,
    /// `DeadlockAborted` if this transaction is chosen as a victim.
    pub fn acquire(&self, tx_id: TxId, resource: LockResource, mode: LockMode) -> Result<()> {
        self.acquire_with_images(tx_id, resource, mode, &[])
    }

    /// Same as [`acquire`](Self::acquire), with the affected row image(s) so
    /// conflicts against column-predicate locks are value-precise.
    pub(crate) fn acquire_with_images(
        &self,
        tx_id: TxId,
        resource: LockResource,
        mode: LockMode,
        images: &[&Row],
    ) -> Result<()> {
        if self.doomed.contains_key(&tx_id) {
            return Err(Error::DeadlockAborted { tx_id });
        }
        {
            let mut table = self.table.lock();
            match self.try_acquire_locked(&mut table, tx_id, &resource, mode, images) {
                TryAcquire::Satisfied => return Ok(()),
                TryAcquire::Granted => {
                    debug!("lock granted: tx={} {} {}", tx_id, mode, resource);
                    return Ok(());
                }
                TryAcquire::MustWait => {
                    table
                        .entries
                        .entry(resource.clone())
                        .or_default()
                        .requests
                        .push_back(LockRequest {
                            tx_id,
                            mode,
                            granted: false,
                        });
                    self.waiting.insert(tx_id, resource.clone());
                    let waits = self.blockers_locked(&table, tx_id, &resource, mode, images);
                    self.detector.set_waiting(tx_id, waits);
                    self.metrics.lock().conflicts += 1;
                }
            }
        }
        debug!("lock blocked: tx={} {} {}", tx_id, mode, resource);
        self.wait_for_grant(tx_id, resource, mode, images)
    }

    /// Explicit single-resource release. Strict 2PL forbids releasing before
    /// transaction end, so this always fails; commit/abort go through
    /// [`release_all`](Self::release_all).
    pub fn release(&self, tx_id: TxId, resource: &LockResource) -> Result<()> {
        Err(Error::protocol(format!(
            "tx {} attempted early release of {} (strict 2PL holds locks to commit/abort)",
            tx_id, resource
        )))
    }

    /// Releases every lock held by `tx_id`. Idempotent; called on commit,
    /// abort, and victim teardown.
    pub fn release_all(&self, tx_id: TxId) {
        let mut table = self.table.lock();
        self.release_all_locked(&mut table, tx_id);
    }

    /// Policy-driven release of statement-scoped ReadCommitted read locks.
    /// Not reachable through the public API.
    pub(crate) fn release_statement_locks(&self, tx_id: TxId, resources: &[LockResource]) {
        let mut table = self.table.lock();
        let mut released = 0usize;
        for resource in resources {
            let now_empty = match table.entries.get_mut(resource) {
                Some(entry) => {
                    let before = entry.requests.len();
                    entry.requests.retain(|r| !(r.granted && r.tx_id == tx_id));
                    released += before - entry.requests.len();
                    entry.requests.is_empty()
                }
                None => false,
            };
            if now_empty {
                table.entries.remove(resource);
            }
            if let Some(mut held) = self.tx_locks.get_mut(&tx_id) {
                held.remove(resource);
            }
        }
        if released > 0 {
            self.detector.locks_released(tx_id, released);
            self.metrics.lock().locks_released += released as u64;
        }
    }

    pub fn holds(&self, tx_id: TxId, resource: &LockResource, mode: LockMode) -> bool {
        let table = self.table.lock();
        table
            .entries
            .get(resource)
            .and_then(|e| e.granted_mode(tx_id))
            .map(|held| held >= mode)
            .unwrap_or(false)
    }

    /// Granted locks on one table, ordered by resource then holder.
    /// Read-only: takes no transaction locks itself.
    pub fn inspect(&self, table_name: &str) -> Vec<(LockResource, LockMode, TxId)> {
        let table = self.table.lock();
        let mut out: Vec<(LockResource, LockMode, TxId)> = table
            .entries
            .iter()
            .filter(|(res, _)| res.table_name() == table_name)
            .flat_map(|(res, entry)| {
                entry
                    .requests
                    .iter()
                    .filter(|r| r.granted)
                    .map(|r| (res.clone(), r.mode, r.tx_id))
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort();
        out
    }

    pub fn metrics(&self) -> LockMetrics {
        self.metrics.lock().clone()
    }

    /// Clears the victim flag once the transaction manager has finalized
    /// the abort.
    pub(crate) fn clear_doomed(&self, tx_id: TxId) {
        self.doomed.remove(&tx_id);
    }

    fn try_acquire_locked(
        &self,
        table: &mut LockTable,
        tx_id: TxId,
        resource: &LockResource,
        mode: LockMode,
        images: &[&Row],
    ) -> TryAcquire {
        let held = table
            .entries
            .get(resource)
            .and_then(|e| e.granted_mode(tx_id));
        match held {
            Some(h) if h >= mode => return TryAcquire::Satisfied,
            Some(_) => {
                // Shared held, Exclusive requested: upgrade in place when no
                // other transaction holds a conflicting lock.
                if self
                    .conflicting_holders_locked(table, tx_id, resource, mode, images)
                    .is_empty()
                {
                    self.grant_locked(table, tx_id, resource, mode);
                    self.metrics.lock().upgrades += 1;
                    debug!("lock upgraded: tx={} {}", tx_id, resource);
                    return TryAcquire::Granted;
                }
                return TryAcquire::MustWait;
            }
            None => {}
        }
        // FIFO fairness: a fresh request never overtakes queued waiters on
        // the same resource, even when it would be compatible right now.
        let has_waiters = table
            .entries
            .get(resource)
            .map(|e| e.first_ungranted().is_some())
            .unwrap_or(false);
        if !has_waiters
            && self
                .conflicting_holders_locked(table, tx_id, resource, mode, images)
                .is_empty()
        {
            self.grant_locked(table, tx_id, resource, mode);
            return TryAcquire::Granted;
        }
        TryAcquire::MustWait
    }

    fn wait_for_grant(
        &self,
        tx_id: TxId,
        resource: LockResource,
        mode: LockMode,
        images: &[&Row],
    ) -> Result<()> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut first_pass = true;
        loop {
            {
                let mut table = self.table.lock();
                if self.doomed.contains_key(&tx_id) {
                    // Victim teardown already cancelled our request.
                    return Err(Error::DeadlockAborted { tx_id });
                }
                let is_next = table
                    .entries
                    .get(&resource)
                    .map(|e| e.first_ungranted() == Some(tx_id))
                    .unwrap_or(false);
                if is_next
                    && self
                        .conflicting_holders_locked(&table, tx_id, &resource, mode, images)
                        .is_empty()
                {
                    // Drop the queued request and re-grant through the
                    // common path; an upgrade collapses onto its Shared
                    // grant there.
                    if let Some(entry) = table.entries.get_mut(&resource) {
                        entry.requests.retain(|r| !(r.tx_id == tx_id && !r.granted));
                    }
                    self.grant_locked(&mut table, tx_id, &resource, mode);
                    self.waiting.remove(&tx_id);
                    self.detector.clear_waiting(tx_id);
                    debug!("lock granted after wait: tx={} {} {}", tx_id, mode, resource);
                    return Ok(());
                }
                let waits = self.blockers_locked(&table, tx_id, &resource, mode, images);
                self.detector.set_waiting(tx_id, waits);
            }

            for victim in self.detector.detect(first_pass) {
                self.apply_victim(&victim);
            }
            first_pass = false;

            if self.doomed.contains_key(&tx_id) {
                return Err(Error::DeadlockAborted { tx_id });
            }
            if Instant::now() >= deadline {
                self.cancel_wait(tx_id, &resource);
                self.metrics.lock().timeouts += 1;
                warn!("lock wait timed out: tx={} {} {}", tx_id, mode, resource);
                return Err(Error::LockTimeout {
                    tx_id,
                    resource: resource.to_string(),
                });
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Tears down a deadlock victim: cancels its queued request, releases
    /// its granted locks, and wakes its waiters — all atomically with the
    /// grant path, so a victim that just got granted is left alone.
    fn apply_victim(&self, victim: &Victim) {
        let mut table = self.table.lock();
        let waiting_on = match self.waiting.get(&victim.tx_id) {
            Some(r) => r.clone(),
            // Granted (or cancelled) between detection and teardown; the
            // cycle no longer exists.
            None => return,
        };
        if self.doomed.insert(victim.tx_id, ()).is_some() {
            return;
        }
        warn!(
            "aborting deadlock victim tx={} (cycle {:?})",
            victim.tx_id, victim.cycle
        );
        let now_empty = match table.entries.get_mut(&waiting_on) {
            Some(entry) => {
                entry
                    .requests
                    .retain(|r| !(r.tx_id == victim.tx_id && !r.granted));
                entry.requests.is_empty()
            }
            None => false,
        };
        if now_empty {
            table.entries.remove(&waiting_on);
        }
        self.waiting.remove(&victim.tx_id);
        self.release_all_locked(&mut table, victim.tx_id);
        self.detector.unregister_transaction(victim.tx_id);
        self.metrics.lock().deadlock_victims += 1;
    }

    fn cancel_wait(&self, tx_id: TxId, resource: &LockResource) {
        let mut table = self.table.lock();
        let now_empty = match table.entries.get_mut(resource) {
            Some(entry) => {
                entry.requests.retain(|r| !(r.tx_id == tx_id && !r.granted));
                entry.requests.is_empty()
            }
            None => false,
        };
        if now_empty {
            table.entries.remove(resource);
        }
        self.waiting.remove(&tx_id);
        self.detector.clear_waiting(tx_id);
    }

    fn grant_locked(
        &self,
        table: &mut LockTable,
        tx_id: TxId,
        resource: &LockResource,
        mode: LockMode,
    ) {
        let entry = table.entries.entry(resource.clone()).or_default();
        // An upgrade replaces the Shared grant rather than stacking on it.
        entry.requests.retain(|r| !(r.granted && r.tx_id == tx_id));
        entry.requests.push_back(LockRequest {
            tx_id,
            mode,
            granted: true,
        });
        let newly_held = self
            .tx_locks
            .entry(tx_id)
            .or_default()
            .insert(resource.clone());
        if newly_held {
            self.detector.lock_acquired(tx_id);
        }
        self.metrics.lock().locks_acquired += 1;
    }

    fn release_all_locked(&self, table: &mut LockTable, tx_id: TxId) {
        let Some((_, resources)) = self.tx_locks.remove(&tx_id) else {
            return;
        };
        let mut released = 0usize;
        for resource in resources {
            let now_empty = match table.entries.get_mut(&resource) {
                Some(entry) => {
                    let before = entry.requests.len();
                    entry.requests.retain(|r| !(r.granted && r.tx_id == tx_id));
                    released += before - entry.requests.len();
                    entry.requests.is_empty()
                }
                None => false,
            };
            if now_empty {
                table.entries.remove(&resource);
            }
        }
        if released > 0 {
            self.detector.locks_released(tx_id, released);
            self.metrics.lock().locks_released += released as u64;
            debug!("released {} lock(s) for tx={}", released, tx_id);
        }
    }

    /// Transactions this request currently conflicts with (incompatible
    /// holders of this or an overlapping resource).
    fn conflicting_holders_locked(
        &self,
        table: &LockTable,
        tx_id: TxId,
        resource: &LockResource,
        mode: LockMode,
        images: &[&Row],
    ) -> HashSet<TxId> {
        let mut holders = HashSet::new();
        for (held_res, entry) in &table.entries {
            if held_res.table_name() != resource.table_name() {
                continue;
            }
            for req in &entry.requests {
                if !req.granted || req.tx_id == tx_id {
                    continue;
                }
                if mode.is_compatible_with(req.mode) {
                    continue;
                }
                let overlap =
                    held_res == resource || resources_overlap(resource, images, held_res);
                if overlap {
                    holders.insert(req.tx_id);
                }
            }
        }
        holders
    }

    /// Everything a blocked request waits on: incompatible holders plus
    /// waiters queued ahead of it on the same resource (FIFO order means
    /// they must be granted first).
    fn blockers_locked(
        &self,
        table: &LockTable,
        tx_id: TxId,
        resource: &LockResource,
        mode: LockMode,
        images: &[&Row],
    ) -> HashSet<TxId> {
        let mut waits = self.conflicting_holders_locked(table, tx_id, resource, mode, images);
        if let Some(entry) = table.entries.get(resource) {
            for req in &entry.requests {
                if req.granted {
                    continue;
                }
                if req.tx_id == tx_id {
                    break;
                }
                waits.insert(req.tx_id);
            }
        }
        waits
    }
}
