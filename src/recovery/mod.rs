use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::buffer::{Affinity, LatchMode, NoWriteAhead};
use crate::checkpoint::{decode_dirty, decode_txs};
use crate::common::{DbError, DbResult};
use crate::core::Core;
use crate::log::record::tag;
use crate::log::{Lsn, RecordKind, NULL_LSN};
use crate::storage::FilePage;

#[derive(Clone, Copy)]
struct TxInfo {
    first_lsn: Lsn,
    first_undo: Lsn,
    undo_next: Lsn,
    committed: bool,
}

/// Three-pass restart: analyze reconstructs the transaction and dirty-page
/// tables from the master checkpoint forward, redo repeats history for
/// pages whose effects may not have reached disk, and undo rolls every
/// loser back through the segment methods (which write CLRs as they go).
pub struct RecoveryManager;

impl RecoveryManager {
    pub fn recover(core: &Core) -> DbResult<()> {
        let sys = core.syskey.snapshot();
        let end = core.log.recover_bounds(sys.master)?;
        if sys.master == NULL_LSN {
            core.pool.set_next_id(sys.next_tx_id);
            info!("empty log, nothing to recover");
            return Ok(());
        }
        info!(master = sys.master, end, "restart recovery starting");

        // ---- analyze ---------------------------------------------------
        let mut txs: HashMap<u64, TxInfo> = HashMap::new();
        let mut dpt: HashMap<FilePage, Lsn> = HashMap::new();
        let mut max_tx = 0u64;
        for (lsn, rec) in core.log.iter_redo(sys.master) {
            if rec.tx_id > max_tx {
                max_tx = rec.tx_id;
            }
            match rec.kind {
                RecordKind::Update | RecordKind::Clr => {
                    let e = txs.entry(rec.tx_id).or_insert(TxInfo {
                        first_lsn: lsn,
                        first_undo: NULL_LSN,
                        undo_next: NULL_LSN,
                        committed: false,
                    });
                    if lsn < e.first_lsn {
                        e.first_lsn = lsn;
                    }
                    // latest wins: a CLR's skip pointer moves the position
                    // backward past compensated work
                    e.undo_next = rec.undo_next;
                    if rec.kind == RecordKind::Update
                        && rec.undo_next != NULL_LSN
                        && (e.first_undo == NULL_LSN || rec.undo_next < e.first_undo)
                    {
                        e.first_undo = rec.undo_next;
                    }
                    if let Some(page) = FilePage::from_raw(rec.page) {
                        dpt.entry(page).or_insert(lsn);
                    }
                }
                RecordKind::Commit => {
                    txs.entry(rec.tx_id)
                        .or_insert(TxInfo {
                            first_lsn: lsn,
                            first_undo: NULL_LSN,
                            undo_next: NULL_LSN,
                            committed: false,
                        })
                        .committed = true;
                }
                RecordKind::BeginCheckpoint => {}
                RecordKind::EndCheckpoint => {
                    if let Some(buf) = rec.chunk(tag::DIRTY_PAGES) {
                        for (page, rec_lsn) in decode_dirty(buf) {
                            let e = dpt.entry(page).or_insert(rec_lsn);
                            if rec_lsn < *e {
                                *e = rec_lsn;
                            }
                        }
                    }
                    if let Some(buf) = rec.chunk(tag::ACTIVE_TXS) {
                        for (id, first_lsn, first_undo, undo_next) in decode_txs(buf) {
                            let e = txs.entry(id).or_insert(TxInfo {
                                first_lsn,
                                first_undo,
                                undo_next,
                                committed: false,
                            });
                            if first_lsn != NULL_LSN && first_lsn < e.first_lsn {
                                e.first_lsn = first_lsn;
                            }
                            if first_undo != NULL_LSN
                                && (e.first_undo == NULL_LSN || first_undo < e.first_undo)
                            {
                                e.first_undo = first_undo;
                            }
                        }
                    }
                }
            }
        }
        txs.retain(|_, info| !info.committed);
        let next_tx_id = max_tx.max(sys.next_tx_id) + 1;
        info!(
            losers = txs.len(),
            dirty_pages = dpt.len(),
            next_tx_id,
            "analysis complete"
        );

        // ---- redo ------------------------------------------------------
        // the log is already durable; WAL checks are vacuous during replay
        core.buffers.set_write_ahead(Arc::new(NoWriteAhead));
        let min_rec = dpt.values().copied().min().unwrap_or(end);
        core.log.rewind_firewall_to(min_rec);
        let mut redone = 0usize;
        for (lsn, rec) in core.log.iter_redo(min_rec) {
            if !matches!(rec.kind, RecordKind::Update | RecordKind::Clr) {
                continue;
            }
            let Some(page_id) = FilePage::from_raw(rec.page) else {
                continue;
            };
            let Some(&rec_lsn) = dpt.get(&page_id) else {
                continue;
            };
            if lsn < rec_lsn {
                continue;
            }
            let pinned = core.buffers.pin(page_id, LatchMode::Exclusive)?;
            let page_lsn = pinned.page().lsn();
            if page_lsn < lsn {
                let method = core.factory.method(rec.segment_type)?;
                {
                    let mut page = pinned.page_mut();
                    method
                        .redo(&mut page, &rec)
                        .map_err(|e| DbError::Redo(e.to_string()))?;
                    page.set_lsn(lsn);
                    page.set_undo_next_lsn(if rec.kind == RecordKind::Clr {
                        rec.page_prev_undo
                    } else {
                        rec.undo_next
                    });
                }
                core.buffers.unpin_dirty(pinned, Affinity::Liked, lsn);
                redone += 1;
            } else {
                // already applied; skip this page's older records faster
                dpt.insert(page_id, page_lsn + 1);
                core.buffers.unpin(pinned, Affinity::Liked);
            }
        }
        info!(redone, "redo complete");

        // ---- rebuild segment methods from the post-redo registry -------
        for (code, name) in &sys.registry {
            if core.factory.method(*code).is_err() {
                warn!(code, name = name.as_str(), "registered segment method unavailable");
            }
        }

        // ---- undo ------------------------------------------------------
        let losers: Vec<_> = txs
            .iter()
            .map(|(&id, info)| core.pool.restore(id, info.first_lsn, info.first_undo, info.undo_next))
            .collect();
        loop {
            let Some(tx) = losers
                .iter()
                .filter(|t| t.undo_next() != NULL_LSN)
                .max_by_key(|t| t.undo_next())
                .cloned()
            else {
                break;
            };
            let next = tx.undo_next();
            let rec = core.log.read_undo(next)?;
            if rec.is_clr {
                tx.state.lock().unwrap().undo_next = rec.undo_next;
                continue;
            }
            core.factory
                .method(rec.segment_type)?
                .undo(core, &rec, &tx)
                .map_err(|e| DbError::Rollback(e.to_string()))?;
            debug_assert!(tx.undo_next() < next);
        }
        // losers are logically committed by the completion of their undo
        for tx in losers {
            let mut rec = crate::log::LogRecord::new(RecordKind::Commit);
            rec.tx_id = tx.id;
            core.log.append_redo(&rec)?;
            core.pool.end(&tx);
        }
        core.log.flush_to(core.log.end_of_log())?;
        info!("undo complete");

        // ---- restart ---------------------------------------------------
        core.buffers.set_write_ahead(core.log.clone());
        core.pool.set_next_id(next_tx_id);
        Ok(())
    }
}
