use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info};

use crate::buffer::BufferPool;
use crate::common::DbResult;
use crate::log::record::tag;
use crate::log::{LogManager, LogRecord, Lsn, RecordKind, NULL_LSN};
use crate::storage::{FilePage, FileSet};
use crate::sys::SystemKey;
use crate::tx::pool::TxPool;

struct CkptState {
    running: bool,
    requested: bool,
    stop: bool,
}

/// Fuzzy checkpoint writer. A background loop takes a checkpoint whenever
/// the log has grown past the interval; the transaction logger can force a
/// synchronous one when redo space runs low. One checkpoint at a time.
pub struct CheckpointWriter {
    log: Arc<LogManager>,
    buffers: Arc<BufferPool>,
    pool: Arc<TxPool>,
    syskey: Arc<SystemKey>,
    files: Arc<FileSet>,
    interval: u64,
    state: Mutex<CkptState>,
    cond: Condvar,
}

impl CheckpointWriter {
    pub fn new(
        log: Arc<LogManager>,
        buffers: Arc<BufferPool>,
        pool: Arc<TxPool>,
        syskey: Arc<SystemKey>,
        files: Arc<FileSet>,
        interval: u64,
    ) -> Arc<Self> {
        Arc::new(CheckpointWriter {
            log,
            buffers,
            pool,
            syskey,
            files,
            interval,
            state: Mutex::new(CkptState {
                running: false,
                requested: false,
                stop: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Start the background loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let me = self.clone();
        std::thread::Builder::new()
            .name("ckpt-writer".to_string())
            .spawn(move || me.run())
            .expect("spawn checkpoint writer")
    }

    fn run(&self) {
        loop {
            let due = {
                let st = self.state.lock().unwrap();
                if st.stop {
                    return;
                }
                let (st, _) = self.cond.wait_timeout(st, Duration::from_millis(200)).unwrap();
                if st.stop {
                    return;
                }
                st.requested || self.log_grown()
            };
            if due {
                if let Err(e) = self.sync_checkpoint() {
                    error!(error = %e, "checkpoint failed");
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.state.lock().unwrap().stop = true;
        self.cond.notify_all();
    }

    fn log_grown(&self) -> bool {
        let end = self.log.end_of_log();
        let start = self.log.start_of_log();
        let master = self.syskey.snapshot().master;
        end - start > self.interval || (master != NULL_LSN && end - master > self.interval)
    }

    /// Nudge the background loop if the log has grown enough.
    pub fn maybe_request_async(&self) {
        if self.log_grown() {
            let mut st = self.state.lock().unwrap();
            if !st.running && !st.requested {
                st.requested = true;
                self.cond.notify_all();
            }
        }
    }

    /// Take a checkpoint now; serialized against the background loop.
    pub fn sync_checkpoint(&self) -> DbResult<()> {
        {
            let mut st = self.state.lock().unwrap();
            while st.running {
                st = self.cond.wait(st).unwrap();
            }
            st.running = true;
        }
        let res = self.do_checkpoint();
        {
            let mut st = self.state.lock().unwrap();
            st.running = false;
            st.requested = false;
        }
        self.cond.notify_all();
        res
    }

    fn do_checkpoint(&self) -> DbResult<()> {
        info!("checkpoint starting");
        // 1. bracket open; its address is the next master
        let begin = LogRecord::new(RecordKind::BeginCheckpoint);
        let master = self.log.append_redo(&begin)?;

        // 2. flush what can be flushed; survivors bound the next redo scan
        let dirty = self.buffers.checkpoint()?;
        let min_rec = dirty
            .iter()
            .map(|(_, lsn)| *lsn)
            .filter(|l| *l != NULL_LSN)
            .min()
            .unwrap_or(master);
        self.log.move_firewall_to(min_rec.min(master));

        // 3. close the bracket with the dirty-page and transaction tables
        let mut end = LogRecord::new(RecordKind::EndCheckpoint);
        end.push(tag::DIRTY_PAGES, encode_dirty(&dirty));
        end.push(tag::ACTIVE_TXS, encode_txs(&self.pool.active_info()));
        let end_lsn = self.log.append_redo(&end)?;

        // 4. both brackets must be durable before the master advances
        self.log.flush_to(end_lsn)?;

        // 5. undo retention, then the force-written system key makes the
        //    checkpoint real
        let min_undo = self.pool.min_first_undo();
        self.log.set_min_undo(if min_undo == NULL_LSN {
            self.log.undo_end()
        } else {
            min_undo
        });
        let undo_base = self.log.try_reclaim_undo()?;
        let commit_lsn = self.pool.min_first_lsn();
        let next_tx_id = self.pool.next_id();
        let file_pages: Vec<(u16, u32)> = self
            .files
            .ids()
            .into_iter()
            .filter_map(|id| self.files.get(id).ok().map(|f| (id, f.page_count())))
            .collect();
        self.syskey.update(|d| {
            d.master = master;
            d.next_tx_id = next_tx_id;
            d.commit_lsn = if commit_lsn == NULL_LSN { master } else { commit_lsn };
            d.undo_base = undo_base;
            d.file_pages = file_pages;
        })?;
        info!(master, remaining_dirty = dirty.len(), "checkpoint complete");
        Ok(())
    }
}

fn encode_dirty(dirty: &[(FilePage, Lsn)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + dirty.len() * 16);
    buf.extend(&(dirty.len() as u32).to_le_bytes());
    for (page, rec_lsn) in dirty {
        buf.extend(&page.to_raw().to_le_bytes());
        buf.extend(&rec_lsn.to_le_bytes());
    }
    buf
}

pub fn decode_dirty(buf: &[u8]) -> Vec<(FilePage, Lsn)> {
    let n = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(n);
    let mut off = 4;
    for _ in 0..n {
        let raw = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        let lsn = u64::from_le_bytes(buf[off + 8..off + 16].try_into().unwrap());
        if let Some(page) = FilePage::from_raw(raw) {
            out.push((page, lsn));
        }
        off += 16;
    }
    out
}

fn encode_txs(txs: &[(u64, Lsn, Lsn, Lsn)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + txs.len() * 32);
    buf.extend(&(txs.len() as u32).to_le_bytes());
    for (id, first_lsn, first_undo, undo_next) in txs {
        buf.extend(&id.to_le_bytes());
        buf.extend(&first_lsn.to_le_bytes());
        buf.extend(&first_undo.to_le_bytes());
        buf.extend(&undo_next.to_le_bytes());
    }
    buf
}

pub fn decode_txs(buf: &[u8]) -> Vec<(u64, Lsn, Lsn, Lsn)> {
    let n = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(n);
    let mut off = 4;
    for _ in 0..n {
        let u = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
        out.push((u(off), u(off + 8), u(off + 16), u(off + 24)));
        off += 32;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_encodings_roundtrip() {
        let dirty = vec![
            (FilePage::new(0, 7), 100u64),
            (FilePage::new(1, 9), 50u64),
        ];
        assert_eq!(decode_dirty(&encode_dirty(&dirty)), dirty);
        let txs = vec![(3u64, 10u64, 11u64, 12u64), (4, 0, 0, 0)];
        assert_eq!(decode_txs(&encode_txs(&txs)), txs);
    }
}
