use std::path::Path;
use std::sync::Mutex;

use crate::common::DbResult;

pub mod record;
pub use record::{Chunk, LogRecord, RecordKind};

pub mod redo;
pub use redo::{RedoIter, RedoLog};

pub mod undo;
pub use undo::UndoLog;

/// Monotonic 64-bit address in the redo log. Undo pointers use the same
/// representation in the undo log's address space. 0 is the null address.
pub type Lsn = u64;
pub const NULL_LSN: Lsn = 0;

/// The two append-only logs plus the pairing discipline: an undo/redo pair
/// is written under one mutex so the records can carry each other's
/// addresses.
pub struct LogManager {
    redo: RedoLog,
    undo: UndoLog,
    pair: Mutex<()>,
}

impl LogManager {
    pub fn open(dir: &Path, redo_capacity: u64, undo_base: Lsn) -> DbResult<Self> {
        let redo = RedoLog::open(&dir.join("redo.log"), redo_capacity)?;
        let undo = UndoLog::open(&dir.join("undo.log"), undo_base)?;
        Ok(LogManager {
            redo,
            undo,
            pair: Mutex::new(()),
        })
    }

    /// Append the pair atomically. The redo record's `undo_next` is pointed
    /// at the reserved undo address; the undo record learns its `pair_lsn`.
    /// Returns `(undo_lsn, redo_lsn)`.
    pub fn write_undo_redo(
        &self,
        undo: &mut LogRecord,
        redo: &mut LogRecord,
    ) -> DbResult<(Lsn, Lsn)> {
        let _g = self.pair.lock().unwrap();
        let ulsn = self.undo.next_addr();
        redo.undo_next = ulsn;
        let lsn = self.redo.append(&redo.to_bytes())?;
        undo.pair_lsn = lsn;
        let written = self.undo.append(&undo.to_bytes())?;
        debug_assert_eq!(written, ulsn);
        Ok((ulsn, lsn))
    }

    /// Append a redo-only record (CLRs, commits, checkpoint brackets).
    pub fn append_redo(&self, rec: &LogRecord) -> DbResult<Lsn> {
        let _g = self.pair.lock().unwrap();
        self.redo.append(&rec.to_bytes())
    }

    pub fn read_undo(&self, ulsn: Lsn) -> DbResult<LogRecord> {
        self.undo.read_at(ulsn)
    }

    /// Durability point: everything up to `lsn` (and all paired undo
    /// records) is on disk when this returns.
    pub fn flush_to(&self, lsn: Lsn) -> DbResult<()> {
        self.undo.flush()?;
        self.redo.flush_to(lsn)
    }

    pub fn end_of_log(&self) -> Lsn {
        self.redo.end_of_log()
    }

    /// The LSN below which all effects are stable, as seen by new pages and
    /// cursor snapshots.
    pub fn stability_point(&self) -> Lsn {
        self.redo.end_of_log()
    }

    pub fn start_of_log(&self) -> Lsn {
        self.redo.start_of_log()
    }

    pub fn get_remaining(&self) -> u64 {
        self.redo.get_remaining()
    }

    pub fn move_firewall_to(&self, lsn: Lsn) {
        self.redo.move_firewall_to(lsn);
    }

    pub fn set_min_undo(&self, ulsn: Lsn) {
        self.undo.set_min_undo(ulsn);
    }

    pub fn undo_base(&self) -> Lsn {
        self.undo.base()
    }

    pub fn undo_end(&self) -> Lsn {
        self.undo.next_addr()
    }

    pub fn try_reclaim_undo(&self) -> DbResult<Lsn> {
        self.undo.try_reclaim()
    }

    pub fn iter_redo(&self, from: Lsn) -> RedoIter<'_> {
        self.redo.iter_from(from)
    }

    /// Restart bookkeeping: find the end of the redo log by scanning
    /// forward from the last known-good address.
    pub fn recover_bounds(&self, master: Lsn) -> DbResult<Lsn> {
        self.redo.recover_bounds(master)
    }

    pub fn rewind_firewall_to(&self, lsn: Lsn) {
        self.redo.rewind_firewall_to(lsn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pair_addresses_cross_link() {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path(), 1024 * 1024, 1).unwrap();
        let mut undo = LogRecord::new(RecordKind::Update);
        let mut redo = LogRecord::new(RecordKind::Update);
        let (ulsn, lsn) = log.write_undo_redo(&mut undo, &mut redo).unwrap();
        assert_eq!(redo.undo_next, ulsn);
        assert_eq!(undo.pair_lsn, lsn);
        let back = log.read_undo(ulsn).unwrap();
        assert_eq!(back.pair_lsn, lsn);
    }

    #[test]
    fn test_flush_and_iterate() {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path(), 1024 * 1024, 1).unwrap();
        let mut lsns = Vec::new();
        for i in 0..5u64 {
            let mut rec = LogRecord::new(RecordKind::Commit);
            rec.tx_id = i;
            lsns.push(log.append_redo(&rec).unwrap());
        }
        log.flush_to(*lsns.last().unwrap()).unwrap();
        let seen: Vec<u64> = log.iter_redo(lsns[0]).map(|(_, r)| r.tx_id).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
