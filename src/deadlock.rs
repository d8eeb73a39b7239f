use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Transaction identifier.
pub type TxId = u64;

/// Per-transaction bookkeeping used for victim selection.
#[derive(Debug, Clone, Default)]
struct TxWaitInfo {
    locks_held: usize,
}

/// A detected cycle and the transaction chosen to break it.
#[derive(Debug, Clone)]
pub struct Victim {
    pub tx_id: TxId,
    pub cycle: Vec<TxId>,
}

/// Deadlock detector over an explicit wait-for adjacency map.
///
/// An edge `A -> B` means transaction A is blocked on a resource held
/// incompatibly by B (or queued ahead of A). Edges are rebuilt by the lock
/// manager on every block/grant/release, never inferred from object graphs.
#[derive(Debug)]
pub struct DeadlockDetector {
    wait_for: Mutex<HashMap<TxId, HashSet<TxId>>>,
    tx_info: Mutex<HashMap<TxId, TxWaitInfo>>,
    check_interval: Duration,
    next_check: Mutex<Instant>,
    deadlocks_detected: AtomicU64,
    victims_selected: AtomicU64,
}

/// Detector statistics.
#[derive(Debug, Clone, Default)]
pub struct DeadlockStats {
    pub registered_transactions: usize,
    pub wait_edges: usize,
    pub deadlocks_detected: u64,
    pub victims_selected: u64,
}

impl DeadlockDetector {
    pub fn new(check_interval: Duration) -> Self {
        Self {
            wait_for: Mutex::new(HashMap::new()),
            tx_info: Mutex::new(HashMap::new()),
            check_interval,
            next_check: Mutex::new(Instant::now()),
            deadlocks_detected: AtomicU64::new(0),
            victims_selected: AtomicU64::new(0),
        }
    }

    pub fn register_transaction(&self, tx_id: TxId) {
        self.tx_info.lock().insert(tx_id, TxWaitInfo::default());
        debug!("registered tx {} for deadlock detection", tx_id);
    }

    /// Drops the transaction's node and every edge touching it.
    pub fn unregister_transaction(&self, tx_id: TxId) {
        self.tx_info.lock().remove(&tx_id);
        let mut wait_for = self.wait_for.lock();
        wait_for.remove(&tx_id);
        for holders in wait_for.values_mut() {
            holders.remove(&tx_id);
        }
    }

    pub fn lock_acquired(&self, tx_id: TxId) {
        if let Some(info) = self.tx_info.lock().get_mut(&tx_id) {
            info.locks_held += 1;
        }
    }

    pub fn locks_released(&self, tx_id: TxId, count: usize) {
        if let Some(info) = self.tx_info.lock().get_mut(&tx_id) {
            info.locks_held = info.locks_held.saturating_sub(count);
        }
    }

    /// Replaces the full out-edge set of a blocked transaction.
    pub fn set_waiting(&self, tx_id: TxId, waiting_on: HashSet<TxId>) {
        let mut wait_for = self.wait_for.lock();
        if waiting_on.is_empty() {
            wait_for.remove(&tx_id);
        } else {
            wait_for.insert(tx_id, waiting_on);
        }
    }

    /// Clears the out-edges of a transaction that stopped waiting.
    pub fn clear_waiting(&self, tx_id: TxId) {
        self.wait_for.lock().remove(&tx_id);
    }

    /// Runs a detection pass if the throttle interval elapsed (or `force`).
    /// Returns one victim per cycle found; the victim is always a node on
    /// its cycle, so aborting it guarantees progress for the rest.
    pub fn detect(&self, force: bool) -> Vec<Victim> {
        {
            let mut next = self.next_check.lock();
            let now = Instant::now();
            if !force && now < *next {
                return Vec::new();
            }
            *next = now + self.check_interval;
        }

        let wait_for = self.wait_for.lock();
        let cycles = find_cycles(&wait_for);
        drop(wait_for);

        if cycles.is_empty() {
            return Vec::new();
        }

        self.deadlocks_detected
            .fetch_add(cycles.len() as u64, Ordering::Relaxed);
        warn!("detected {} deadlock cycle(s)", cycles.len());

        let tx_info = self.tx_info.lock();
        let mut victims = Vec::new();
        for cycle in cycles {
            if let Some(victim) = select_victim(&cycle, &tx_info) {
                warn!("selected victim tx {} for cycle {:?}", victim, cycle);
                self.victims_selected.fetch_add(1, Ordering::Relaxed);
                victims.push(Victim {
                    tx_id: victim,
                    cycle,
                });
            }
        }
        victims
    }

    /// Read-only copy of the wait-for graph, for observability.
    pub fn wait_graph(&self) -> HashMap<TxId, HashSet<TxId>> {
        self.wait_for.lock().clone()
    }

    pub fn stats(&self) -> DeadlockStats {
        DeadlockStats {
            registered_transactions: self.tx_info.lock().len(),
            wait_edges: self.wait_for.lock().values().map(|s| s.len()).sum(),
            deadlocks_detected: self.deadlocks_detected.load(Ordering::Relaxed),
            victims_selected: self.victims_selected.load(Ordering::Relaxed),
        }
    }
}

/// DFS with visited/in-progress marking. Returns each cycle found once,
/// as the node sequence along the back edge.
fn find_cycles(wait_for: &HashMap<TxId, HashSet<TxId>>) -> Vec<Vec<TxId>> {
    let mut visited = HashSet::new();
    let mut cycles = Vec::new();

    for &start in wait_for.keys() {
        if visited.contains(&start) {
            continue;
        }
        let mut path = Vec::new();
        let mut on_path = HashSet::new();
        dfs(start, wait_for, &mut visited, &mut path, &mut on_path, &mut cycles);
    }
    cycles
}

fn dfs(
    node: TxId,
    wait_for: &HashMap<TxId, HashSet<TxId>>,
    visited: &mut HashSet<TxId>,
    path: &mut Vec<TxId>,
    on_path: &mut HashSet<TxId>,
    cycles: &mut Vec<Vec<TxId>>,
) {
    visited.insert(node);
    path.push(node);
    on_path.insert(node);

    if let Some(nexts) = wait_for.get(&node) {
        // Sorted for deterministic cycle reporting.
        let mut nexts: Vec<TxId> = nexts.iter().copied().collect();
        nexts.sort_unstable();
        for next in nexts {
            if on_path.contains(&next) {
                let from = path.iter().position(|&n| n == next).unwrap_or(0);
                cycles.push(path[from..].to_vec());
            } else if !visited.contains(&next) {
                dfs(next, wait_for, visited, path, on_path, cycles);
            }
        }
    }

    path.pop();
    on_path.remove(&node);
}

/// Fewest held locks first; ties go to the most recently started
/// transaction (ids are monotonic, so highest id is youngest).
fn select_victim(cycle: &[TxId], tx_info: &HashMap<TxId, TxWaitInfo>) -> Option<TxId> {
    cycle
        .iter()
        .copied()
        .min_by_key(|tx| {
            let held = tx_info.get(tx).map(|i| i.locks_held).unwrap_or(0);
            (held, std::cmp::Reverse(*tx))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> DeadlockDetector {
        DeadlockDetector::new(Duration::from_millis(0))
    }

    fn edges(d: &DeadlockDetector, pairs: &[(TxId, TxId)]) {
        for &(a, b) in pairs {
            let mut set = d.wait_graph().remove(&a).unwrap_or_default();
            set.insert(b);
            d.set_waiting(a, set);
        }
    }

    #[test]
    fn test_two_cycle_detection() {
        let d = detector();
        d.register_transaction(1);
        d.register_transaction(2);
        edges(&d, &[(1, 2), (2, 1)]);

        let victims = d.detect(true);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].cycle.len(), 2);
        assert!(victims[0].cycle.contains(&1) && victims[0].cycle.contains(&2));
    }

    #[test]
    fn test_three_cycle_detection() {
        let d = detector();
        for tx in 1..=3 {
            d.register_transaction(tx);
        }
        edges(&d, &[(1, 2), (2, 3), (3, 1)]);

        let victims = d.detect(true);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].cycle.len(), 3);
    }

    #[test]
    fn test_no_false_positive_on_chain() {
        let d = detector();
        for tx in 1..=3 {
            d.register_transaction(tx);
        }
        edges(&d, &[(1, 2), (2, 3)]);
        assert!(d.detect(true).is_empty());
    }

    #[test]
    fn test_victim_has_fewest_locks() {
        let d = detector();
        d.register_transaction(1);
        d.register_transaction(2);
        d.lock_acquired(1);
        d.lock_acquired(1);
        d.lock_acquired(2);
        edges(&d, &[(1, 2), (2, 1)]);

        let victims = d.detect(true);
        assert_eq!(victims[0].tx_id, 2);
    }

    #[test]
    fn test_tie_breaks_to_youngest() {
        let d = detector();
        d.register_transaction(1);
        d.register_transaction(2);
        d.lock_acquired(1);
        d.lock_acquired(2);
        edges(&d, &[(1, 2), (2, 1)]);

        // Equal lock counts: the higher (younger) id loses.
        let victims = d.detect(true);
        assert_eq!(victims[0].tx_id, 2);
    }

    #[test]
    fn test_unregister_drops_edges() {
        let d = detector();
        d.register_transaction(1);
        d.register_transaction(2);
        edges(&d, &[(1, 2), (2, 1)]);
        d.unregister_transaction(2);
        assert!(d.detect(true).is_empty());
        assert_eq!(d.stats().wait_edges, 0);
    }
}
