use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::common::{DbError, DbResult};
use crate::log::{Lsn, NULL_LSN};
use crate::storage::Rowid;

/// A commit visibility snapshot. All ids below `base` are committed; ids at
/// `base + i` are committed iff bit `i` is set. `commit_tx` is the universal
/// threshold (committed with respect to every snapshot alive at capture) and
/// `commit_lsn` the redo address below which every record belongs to a
/// finished transaction.
#[derive(Clone, Debug)]
pub struct CommitList {
    base: u64,
    bits: Vec<u64>,
    pub commit_tx: u64,
    pub commit_lsn: Lsn,
}

impl CommitList {
    fn new(start_id: u64) -> Self {
        CommitList {
            base: start_id,
            bits: Vec::new(),
            commit_tx: start_id,
            commit_lsn: NULL_LSN,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn is_committed(&self, id: u64) -> bool {
        if id < self.base {
            return true;
        }
        let idx = (id - self.base) as usize;
        match self.bits.get(idx / 64) {
            Some(word) => word & (1u64 << (idx % 64)) != 0,
            None => false,
        }
    }

    fn set(&mut self, id: u64) {
        if id < self.base {
            return;
        }
        let idx = (id - self.base) as usize;
        let word = idx / 64;
        if word >= self.bits.len() {
            self.bits.resize(word + 1, 0);
        }
        self.bits[word] |= 1u64 << (idx % 64);
        self.advance();
    }

    fn advance(&mut self) {
        while !self.bits.is_empty() && self.bits[0] & 1 != 0 {
            let n = self.bits.len();
            for i in 0..n {
                let carry = if i + 1 < n { self.bits[i + 1] << 63 } else { 0 };
                self.bits[i] = (self.bits[i] >> 1) | carry;
            }
            if *self.bits.last().unwrap() == 0 {
                self.bits.pop();
            }
            self.base += 1;
        }
    }
}

pub struct TxState {
    /// Redo address of the transaction's first update.
    pub first_lsn: Lsn,
    /// Undo address of the first undo record (chain terminator).
    pub first_undo: Lsn,
    /// Undo address of the newest undo record; 0 when nothing to undo.
    pub undo_next: Lsn,
    pub committed: bool,
    pub cancelled: bool,
    pub finished: bool,
    pub suspended: bool,
    pub rollback_cost: u64,
    pub lock_stack: Vec<Rowid>,
}

/// One client transaction. The captured snapshot is immutable; all mutable
/// state sits behind the mutex. Waiters on this transaction's outcome park
/// on `done`.
pub struct Transaction {
    pub id: u64,
    pub serializable: bool,
    pub snapshot: CommitList,
    pub(crate) state: Mutex<TxState>,
    pub(crate) done: Condvar,
}

impl Transaction {
    fn new(id: u64, serializable: bool, snapshot: CommitList) -> Self {
        Transaction {
            id,
            serializable,
            snapshot,
            state: Mutex::new(TxState {
                first_lsn: NULL_LSN,
                first_undo: NULL_LSN,
                undo_next: NULL_LSN,
                committed: false,
                cancelled: false,
                finished: false,
                suspended: false,
                rollback_cost: 0,
                lock_stack: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    pub fn first_lsn(&self) -> Lsn {
        self.state.lock().unwrap().first_lsn
    }

    pub fn first_undo(&self) -> Lsn {
        self.state.lock().unwrap().first_undo
    }

    pub fn undo_next(&self) -> Lsn {
        self.state.lock().unwrap().undo_next
    }

    pub fn is_committed(&self) -> bool {
        self.state.lock().unwrap().committed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }

    /// Marks the deadlock victim. Every subsequent blocking call throws.
    /// Committed transactions cannot be cancelled.
    pub fn cancel(&self) {
        let mut st = self.state.lock().unwrap();
        if !st.committed {
            st.cancelled = true;
            self.done.notify_all();
        }
    }

    pub fn check_cancelled(&self) -> DbResult<()> {
        if self.is_cancelled() {
            return Err(DbError::TransactionCancelled);
        }
        Ok(())
    }

    /// Whether `other`'s effects are visible to this transaction.
    pub fn sees(&self, other: u64) -> bool {
        other == self.id || self.snapshot.is_committed(other)
    }

    pub fn note_lock(&self, rid: Rowid) {
        let mut st = self.state.lock().unwrap();
        st.lock_stack.push(rid);
        st.rollback_cost += 1;
    }

    pub fn lock_depth(&self) -> usize {
        self.state.lock().unwrap().lock_stack.len()
    }

    pub fn truncate_locks(&self, depth: usize) {
        self.state.lock().unwrap().lock_stack.truncate(depth);
    }

    pub fn rollback_cost(&self) -> u64 {
        self.state.lock().unwrap().rollback_cost
    }

    /// Park until this transaction finishes or `waiter` is cancelled.
    pub(crate) fn wait_done(&self, waiter: &Transaction, slice: Duration) -> DbResult<()> {
        let mut st = self.state.lock().unwrap();
        while !st.finished {
            waiter.check_cancelled()?;
            let (guard, _) = self.done.wait_timeout(st, slice).unwrap();
            st = guard;
        }
        Ok(())
    }
}

struct PoolInner {
    master: CommitList,
    active: HashMap<u64, Arc<Transaction>>,
    next_id: u64,
    quiesced: bool,
}

/// The pool of live transactions and the master commit list. Only the
/// master list is ever mutated; snapshots captured at begin are immutable.
pub struct TxPool {
    inner: Mutex<PoolInner>,
    cond: Condvar,
}

impl TxPool {
    pub fn new(start_id: u64) -> Self {
        TxPool {
            inner: Mutex::new(PoolInner {
                master: CommitList::new(start_id),
                active: HashMap::new(),
                next_id: start_id,
                quiesced: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Assign the next id and capture the commit snapshot. `end_of_log`
    /// seeds `commit_lsn` when no other transaction is active.
    pub fn begin(&self, serializable: bool, end_of_log: Lsn) -> DbResult<Arc<Transaction>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.quiesced {
            return Err(DbError::Database("transaction pool is quiesced".to_string()));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let mut snapshot = inner.master.clone();
        snapshot.commit_tx = inner
            .active
            .values()
            .map(|t| t.snapshot.base)
            .min()
            .unwrap_or(inner.master.base);
        snapshot.commit_lsn = inner
            .active
            .values()
            .map(|t| t.first_lsn())
            .filter(|l| *l != NULL_LSN)
            .min()
            .unwrap_or(end_of_log);
        let tx = Arc::new(Transaction::new(id, serializable, snapshot));
        inner.active.insert(id, tx.clone());
        debug!(tx = id, serializable, "transaction begun");
        Ok(tx)
    }

    /// Mark the transaction's bit in the master list and signal waiters.
    /// Ids are never reused once a transaction had any visible effect.
    pub fn end(&self, tx: &Arc<Transaction>) {
        let mut inner = self.inner.lock().unwrap();
        inner.master.set(tx.id);
        inner.active.remove(&tx.id);
        {
            let mut st = tx.state.lock().unwrap();
            st.finished = true;
        }
        tx.done.notify_all();
        self.cond.notify_all();
    }

    pub fn get(&self, id: u64) -> Option<Arc<Transaction>> {
        self.inner.lock().unwrap().active.get(&id).cloned()
    }

    /// Committed in the master list (read-committed visibility).
    pub fn master_committed(&self, id: u64) -> bool {
        self.inner.lock().unwrap().master.is_committed(id)
    }

    /// Committed with respect to every snapshot that could still be taken.
    pub fn is_universally_committed(&self, id: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        let floor = inner
            .active
            .values()
            .map(|t| t.snapshot.base)
            .min()
            .unwrap_or(inner.master.base);
        id < floor && inner.master.is_committed(id)
    }

    pub fn next_id(&self) -> u64 {
        self.inner.lock().unwrap().next_id
    }

    pub fn set_next_id(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id = id;
        if inner.master.base < id && inner.active.is_empty() {
            inner.master = CommitList::new(id);
        }
    }

    /// Re-register a loser transaction during restart undo.
    pub fn restore(
        &self,
        id: u64,
        first_lsn: Lsn,
        first_undo: Lsn,
        undo_next: Lsn,
    ) -> Arc<Transaction> {
        let mut inner = self.inner.lock().unwrap();
        let snapshot = inner.master.clone();
        let tx = Arc::new(Transaction::new(id, false, snapshot));
        {
            let mut st = tx.state.lock().unwrap();
            st.first_lsn = first_lsn;
            st.first_undo = first_undo;
            st.undo_next = undo_next;
        }
        inner.active.insert(id, tx.clone());
        tx
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }

    /// `(id, first_lsn, first_undo, undo_next)` of every active transaction.
    pub fn active_info(&self) -> Vec<(u64, Lsn, Lsn, Lsn)> {
        self.inner
            .lock()
            .unwrap()
            .active
            .values()
            .map(|t| {
                let st = t.state.lock().unwrap();
                (t.id, st.first_lsn, st.first_undo, st.undo_next)
            })
            .collect()
    }

    /// Min `first_lsn` over active transactions, or 0 when none.
    pub fn min_first_lsn(&self) -> Lsn {
        self.active_info()
            .iter()
            .map(|(_, f, _, _)| *f)
            .filter(|l| *l != NULL_LSN)
            .min()
            .unwrap_or(NULL_LSN)
    }

    /// Min `first_undo` over active transactions, or 0 when none.
    pub fn min_first_undo(&self) -> Lsn {
        self.active_info()
            .iter()
            .map(|(_, _, f, _)| *f)
            .filter(|l| *l != NULL_LSN)
            .min()
            .unwrap_or(NULL_LSN)
    }

    /// Stop admitting transactions and wait for the active set to drain.
    pub fn quiesce(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        inner.quiesced = true;
        while !inner.active.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
        true
    }

    pub fn unquiesce(&self) {
        self.inner.lock().unwrap().quiesced = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_list_advances_base() {
        let mut cl = CommitList::new(10);
        assert!(cl.is_committed(9));
        assert!(!cl.is_committed(10));
        cl.set(11);
        assert!(cl.is_committed(11));
        assert_eq!(cl.base(), 10);
        cl.set(10);
        // 10 and 11 both committed, base slides past both
        assert_eq!(cl.base(), 12);
        assert!(cl.is_committed(10));
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let pool = TxPool::new(1);
        let t1 = pool.begin(false, 100).unwrap();
        let t2 = pool.begin(false, 100).unwrap();
        let snap = t2.snapshot.clone();
        pool.end(&t1);
        // t2's captured list does not see t1's commit
        assert!(!snap.is_committed(t1.id));
        assert!(!t2.snapshot.is_committed(t1.id));
        // a fresh snapshot does
        let t3 = pool.begin(false, 100).unwrap();
        assert!(t3.snapshot.is_committed(t1.id));
        pool.end(&t2);
        pool.end(&t3);
    }

    #[test]
    fn test_universal_commit_floor() {
        let pool = TxPool::new(1);
        let t1 = pool.begin(false, 0).unwrap();
        let t2 = pool.begin(false, 0).unwrap();
        pool.end(&t1);
        // t2's snapshot predates t1's commit, so t1 is not universal yet
        assert!(!pool.is_universally_committed(t1.id));
        pool.end(&t2);
        assert!(pool.is_universally_committed(t1.id));
    }

    #[test]
    fn test_quiesce_blocks_begin() {
        let pool = Arc::new(TxPool::new(1));
        let t1 = pool.begin(false, 0).unwrap();
        let p = pool.clone();
        let h = std::thread::spawn(move || p.quiesce(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(50));
        assert!(pool.begin(false, 0).is_err());
        pool.end(&t1);
        assert!(h.join().unwrap());
        pool.unquiesce();
        assert!(pool.begin(false, 0).is_ok());
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let pool = Arc::new(TxPool::new(1));
        let holder = pool.begin(false, 0).unwrap();
        let waiter = pool.begin(false, 0).unwrap();
        let h2 = holder.clone();
        let w2 = waiter.clone();
        let h = std::thread::spawn(move || h2.wait_done(&w2, Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(30));
        waiter.cancel();
        assert!(matches!(h.join().unwrap(), Err(DbError::TransactionCancelled)));
        pool.end(&holder);
        pool.end(&waiter);
    }
}
