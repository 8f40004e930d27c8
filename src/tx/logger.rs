use std::sync::{Arc, OnceLock};

use tracing::{debug, trace};

use crate::buffer::PinnedPage;
use crate::checkpoint::CheckpointWriter;
use crate::common::{DbError, DbResult};
use crate::config::REDO_RESERVE;
use crate::log::{LogManager, LogRecord, Lsn, RecordKind, NULL_LSN};
use crate::tx::pool::{Transaction, TxPool};

/// Dispatches an undo record to the segment method that can invert it.
/// Implemented by the composed engine via the segment factory.
pub trait UndoDispatch: Send + Sync {
    fn undo(&self, rec: &LogRecord, tx: &Arc<Transaction>) -> DbResult<()>;
}

/// A bracketed sub-transaction whose effects survive the outer rollback.
/// Must be committed or rolled back exactly once.
pub struct NestedTopAction {
    saved_undo: Lsn,
    saved_locks: usize,
    done: bool,
}

impl NestedTopAction {
    pub fn savepoint(&self) -> Lsn {
        self.saved_undo
    }
}

impl Drop for NestedTopAction {
    fn drop(&mut self) {
        debug_assert!(self.done, "nested top action neither committed nor rolled back");
    }
}

/// Writes undo/redo pairs on behalf of transactions and drives commit and
/// rollback. The pair write stamps the transaction chain, the page's LSN
/// and the page's undo chain in one motion.
pub struct TxLogger {
    log: Arc<LogManager>,
    pool: Arc<TxPool>,
    ckpt: OnceLock<Arc<CheckpointWriter>>,
}

impl TxLogger {
    pub fn new(log: Arc<LogManager>, pool: Arc<TxPool>) -> Self {
        TxLogger {
            log,
            pool,
            ckpt: OnceLock::new(),
        }
    }

    pub fn attach_checkpoint(&self, ckpt: Arc<CheckpointWriter>) {
        let _ = self.ckpt.set(ckpt);
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// Append the undo/redo pair for a page mutation performed under the
    /// caller's exclusive latch. Returns the redo LSN, which the caller
    /// hands to `unpin_dirty`.
    pub fn write_undo_redo(
        &self,
        tx: &Arc<Transaction>,
        pinned: &PinnedPage,
        mut undo: LogRecord,
        mut redo: LogRecord,
    ) -> DbResult<Lsn> {
        tx.check_cancelled()?;
        let need = redo.to_bytes().len() as u64 + 128;
        if self.log.get_remaining() < need + REDO_RESERVE {
            if let Some(c) = self.ckpt.get() {
                c.sync_checkpoint()?;
            }
            if self.log.get_remaining() < need {
                return Err(DbError::LogExhausted(
                    "redo log full after checkpoint".to_string(),
                ));
            }
        }
        if let Some(c) = self.ckpt.get() {
            c.maybe_request_async();
        }
        undo.tx_id = tx.id;
        redo.tx_id = tx.id;
        let mut st = tx.state.lock().unwrap();
        if !undo.is_clr {
            undo.undo_next = st.undo_next;
        }
        let mut page = pinned.page_mut();
        undo.page_prev_undo = page.undo_next_lsn();
        let (ulsn, lsn) = self.log.write_undo_redo(&mut undo, &mut redo)?;
        if st.first_lsn == NULL_LSN {
            st.first_lsn = lsn;
        }
        if st.first_undo == NULL_LSN {
            st.first_undo = ulsn;
        }
        st.undo_next = ulsn;
        st.rollback_cost += 1;
        page.set_undo_next_lsn(ulsn);
        page.set_lsn(lsn);
        trace!(tx = tx.id, lsn, ulsn, page = %pinned.id(), "logged update pair");
        Ok(lsn)
    }

    /// Log a page mutation as a physical old/new pair over the changed byte
    /// range. The caller mutates the page first (body bytes only; the LSN
    /// header fields are the logger's), passing the pre-image. Returns the
    /// redo LSN, or None when nothing changed.
    pub fn log_page_change(
        &self,
        tx: &Arc<Transaction>,
        pinned: &PinnedPage,
        before: &crate::storage::Page,
        segment_id: u64,
        segment_type: u8,
        page_type: u8,
    ) -> DbResult<Option<Lsn>> {
        use crate::log::record::tag;
        let (off, old, new) = {
            let after = pinned.page();
            match crate::storage::Page::diff_range(before, &after) {
                None => return Ok(None),
                Some((s, e)) => (
                    s,
                    before.bytes()[s..e].to_vec(),
                    after.bytes()[s..e].to_vec(),
                ),
            }
        };
        let mut undo = LogRecord::new(RecordKind::Update);
        let mut redo = LogRecord::new(RecordKind::Update);
        for rec in [&mut undo, &mut redo] {
            rec.segment_id = segment_id;
            rec.page = pinned.id().to_raw();
            rec.segment_type = segment_type;
            rec.page_type = page_type;
            rec.push_u16(tag::OFFSET, off as u16);
        }
        undo.push(tag::OLD, old);
        redo.push(tag::NEW, new);
        let lsn = self.write_undo_redo(tx, pinned, undo, redo)?;
        Ok(Some(lsn))
    }

    /// Append a compensation record. Its `undo_next` must already point
    /// past the record it compensates; the transaction's undo position
    /// skips there. Pass the pinned page the CLR redoes against, if any.
    pub fn append_clr(
        &self,
        tx: &Arc<Transaction>,
        pinned: Option<&PinnedPage>,
        mut clr: LogRecord,
    ) -> DbResult<Lsn> {
        clr.kind = RecordKind::Clr;
        clr.is_clr = true;
        clr.tx_id = tx.id;
        let mut st = tx.state.lock().unwrap();
        let lsn = self.log.append_redo(&clr)?;
        st.undo_next = clr.undo_next;
        if let Some(p) = pinned {
            p.page_mut().set_lsn(lsn);
        }
        trace!(tx = tx.id, lsn, skip_to = clr.undo_next, "logged clr");
        Ok(lsn)
    }

    /// Current rollback position, usable as a partial-rollback target.
    pub fn savepoint(&self, tx: &Arc<Transaction>) -> Lsn {
        tx.undo_next()
    }

    /// Append COMMIT, flush the log through it, mark the transaction
    /// committed and release its waiters.
    pub fn commit(&self, tx: &Arc<Transaction>) -> DbResult<()> {
        tx.check_cancelled()?;
        let mut rec = LogRecord::new(RecordKind::Commit);
        rec.tx_id = tx.id;
        let lsn = self.log.append_redo(&rec)?;
        self.log.flush_to(lsn)?;
        tx.state.lock().unwrap().committed = true;
        self.pool.end(tx);
        debug!(tx = tx.id, lsn, "committed");
        Ok(())
    }

    /// Walk the undo chain back to `savepoint` (0 for a full rollback),
    /// dispatching each non-CLR record. The delegate writes the CLR, which
    /// advances the chain position.
    pub fn rollback_to(
        &self,
        tx: &Arc<Transaction>,
        savepoint: Lsn,
        dispatch: &dyn UndoDispatch,
    ) -> DbResult<()> {
        loop {
            let next = tx.undo_next();
            if next == NULL_LSN || next <= savepoint {
                break;
            }
            let rec = self.log.read_undo(next)?;
            if rec.is_clr {
                tx.state.lock().unwrap().undo_next = rec.undo_next;
                continue;
            }
            dispatch
                .undo(&rec, tx)
                .map_err(|e| DbError::Rollback(e.to_string()))?;
            debug_assert!(tx.undo_next() < next, "undo delegate must write a clr");
        }
        Ok(())
    }

    /// Full rollback, then end the transaction. The id joins the commit
    /// list: with every effect undone, finished-and-undone is
    /// indistinguishable from committed to onlookers.
    pub fn abort(&self, tx: &Arc<Transaction>, dispatch: &dyn UndoDispatch) -> DbResult<()> {
        self.rollback_to(tx, NULL_LSN, dispatch)?;
        let mut rec = LogRecord::new(RecordKind::Commit);
        rec.tx_id = tx.id;
        let lsn = self.log.append_redo(&rec)?;
        self.log.flush_to(lsn)?;
        self.pool.end(tx);
        debug!(tx = tx.id, "aborted");
        Ok(())
    }

    /// Open a nested top action at the transaction's current position.
    pub fn begin_nested(&self, tx: &Arc<Transaction>) -> NestedTopAction {
        NestedTopAction {
            saved_undo: tx.undo_next(),
            saved_locks: tx.lock_depth(),
            done: false,
        }
    }

    /// Commit the inner sequence: a CLR whose `undo_next` is the savepoint
    /// makes any outer rollback skip it, while the records stay durable.
    pub fn commit_nested(&self, tx: &Arc<Transaction>, mut nta: NestedTopAction) -> DbResult<()> {
        nta.done = true;
        if tx.undo_next() != nta.saved_undo {
            let mut clr = LogRecord::new(RecordKind::Clr);
            clr.undo_next = nta.saved_undo;
            self.append_clr(tx, None, clr)?;
        }
        Ok(())
    }

    /// Abandon the inner sequence, undoing its records only.
    pub fn rollback_nested(
        &self,
        tx: &Arc<Transaction>,
        mut nta: NestedTopAction,
        dispatch: &dyn UndoDispatch,
    ) -> DbResult<()> {
        nta.done = true;
        self.rollback_to(tx, nta.saved_undo, dispatch)?;
        tx.truncate_locks(nta.saved_locks);
        Ok(())
    }
}
