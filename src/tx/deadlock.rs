use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::common::{DbError, DbResult};
use crate::config::LOCK_WAIT_SLICE_MS;
use crate::tx::pool::{Transaction, TxPool};

/// Proactive deadlock detection over the wait-for graph. Each transaction
/// waits for at most one holder at a time, so the graph is a set of chains;
/// a cycle through the caller is found by walking successors.
pub struct DeadlockDetector {
    pool: Arc<TxPool>,
    edges: Mutex<HashMap<u64, u64>>,
}

impl DeadlockDetector {
    pub fn new(pool: Arc<TxPool>) -> Self {
        DeadlockDetector {
            pool,
            edges: Mutex::new(HashMap::new()),
        }
    }

    /// Record `waiter -> holder`, check for a cycle, then park until the
    /// holder finishes. On a cycle the newest (highest-cost loses ties to
    /// highest id) member is cancelled; if that is the waiter itself this
    /// returns `TransactionCancelled`.
    pub fn wait_for(&self, waiter: &Arc<Transaction>, holder_id: u64) -> DbResult<()> {
        waiter.check_cancelled()?;
        let holder = match self.pool.get(holder_id) {
            Some(h) => h,
            // already committed or aborted; caller just retries
            None => return Ok(()),
        };
        if holder.is_finished() {
            return Ok(());
        }
        {
            let mut edges = self.edges.lock().unwrap();
            edges.insert(waiter.id, holder.id);
            if let Some(cycle) = find_cycle(&edges, waiter.id) {
                let victim_id = self.pick_victim(&cycle);
                warn!(?cycle, victim = victim_id, "deadlock detected");
                if let Some(victim) = self.pool.get(victim_id) {
                    victim.cancel();
                }
                if victim_id == waiter.id {
                    edges.remove(&waiter.id);
                    return Err(DbError::TransactionCancelled);
                }
            }
        }
        debug!(waiter = waiter.id, holder = holder.id, "waiting for lock holder");
        let res = holder.wait_done(waiter, Duration::from_millis(LOCK_WAIT_SLICE_MS));
        self.edges.lock().unwrap().remove(&waiter.id);
        res
    }

    /// Signal that a transaction finished; its waiters re-check on their own
    /// condition variable, this only trims the graph.
    pub fn finished(&self, tx_id: u64) {
        self.edges.lock().unwrap().retain(|_, h| *h != tx_id);
    }

    fn pick_victim(&self, cycle: &[u64]) -> u64 {
        let mut best = cycle[0];
        let mut best_key = (0u64, 0u64);
        for &id in cycle {
            let cost = self.pool.get(id).map(|t| t.rollback_cost()).unwrap_or(0);
            // prefer the cheapest rollback; ties go to the newest
            let key = (u64::MAX - cost, id);
            if key > best_key {
                best_key = key;
                best = id;
            }
        }
        best
    }
}

fn find_cycle(edges: &HashMap<u64, u64>, from: u64) -> Option<Vec<u64>> {
    let mut path = vec![from];
    let mut seen = HashSet::new();
    seen.insert(from);
    let mut cur = *edges.get(&from)?;
    loop {
        if cur == from {
            return Some(path);
        }
        if !seen.insert(cur) {
            // a cycle not involving `from`
            return None;
        }
        path.push(cur);
        cur = *edges.get(&cur)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_no_cycle_waits_for_commit() {
        let pool = Arc::new(TxPool::new(1));
        let det = Arc::new(DeadlockDetector::new(pool.clone()));
        let holder = pool.begin(false, 0).unwrap();
        let waiter = pool.begin(false, 0).unwrap();

        let d = det.clone();
        let w = waiter.clone();
        let hid = holder.id;
        let h = thread::spawn(move || d.wait_for(&w, hid));

        thread::sleep(Duration::from_millis(50));
        pool.end(&holder);
        assert!(h.join().unwrap().is_ok());
        pool.end(&waiter);
    }

    #[test]
    fn test_two_party_cycle_cancels_one() {
        let pool = Arc::new(TxPool::new(1));
        let det = Arc::new(DeadlockDetector::new(pool.clone()));
        let t1 = pool.begin(false, 0).unwrap();
        let t2 = pool.begin(false, 0).unwrap();

        let results: Vec<_> = [(t1.clone(), t2.id), (t2.clone(), t1.id)]
            .into_iter()
            .map(|(me, other)| {
                let d = det.clone();
                let p = pool.clone();
                thread::spawn(move || {
                    let r = d.wait_for(&me, other);
                    if r.is_err() {
                        // the victim aborts, releasing its waiters
                        p.end(&me);
                    }
                    r
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        let cancelled = results.iter().filter(|r| r.is_err()).count();
        assert_eq!(cancelled, 1, "exactly one victim expected");
        pool.end(&t1);
        pool.end(&t2);
    }

    #[test]
    fn test_finished_holder_is_no_wait() {
        let pool = Arc::new(TxPool::new(1));
        let det = DeadlockDetector::new(pool.clone());
        let t1 = pool.begin(false, 0).unwrap();
        let gone = pool.begin(false, 0).unwrap();
        pool.end(&gone);
        assert!(det.wait_for(&t1, gone.id).is_ok());
        assert!(det.wait_for(&t1, 9999).is_ok());
        pool.end(&t1);
    }
}
