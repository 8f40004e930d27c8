use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use fs2::FileExt;
use tracing::{debug, info};

use crate::common::{DbError, DbResult};
use crate::log::record::{self, LogRecord, MIN_FRAME};
use crate::log::Lsn;

const MAGIC: u32 = 0x4c424443; // "CDBL"
const HEADER: u64 = 8;

struct RedoState {
    /// Firewall: the oldest address still needed. Space before it is reusable.
    start: Lsn,
    /// Next address to be assigned.
    end: Lsn,
    /// Everything below this is durable.
    flushed: Lsn,
}

/// The circular redo log. Addresses grow monotonically; the physical
/// position is the address modulo capacity. A record never straddles the
/// wrap point; the writer pads the tail with a zero-length marker instead.
pub struct RedoLog {
    file: Mutex<File>,
    capacity: u64,
    state: Mutex<RedoState>,
}

impl RedoLog {
    pub fn open(path: &Path, capacity: u64) -> DbResult<Self> {
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| DbError::Database(format!("{} is in use", path.display())))?;
        if !exists || file.metadata()?.len() < HEADER {
            file.set_len(HEADER + capacity)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&MAGIC.to_le_bytes())?;
            file.write_all(&[0u8; 4])?;
            file.sync_all()?;
            info!(path = %path.display(), capacity, "initialized redo log");
        } else {
            let mut magic = [0u8; 4];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut magic)?;
            if u32::from_le_bytes(magic) != MAGIC {
                return Err(DbError::Database("invalid redo log header".to_string()));
            }
        }
        Ok(RedoLog {
            file: Mutex::new(file),
            capacity,
            state: Mutex::new(RedoState {
                start: 1,
                end: 1,
                flushed: 1,
            }),
        })
    }

    fn phys(&self, lsn: Lsn) -> u64 {
        HEADER + (lsn - 1) % self.capacity
    }

    fn tail(&self, lsn: Lsn) -> u64 {
        self.capacity - (lsn - 1) % self.capacity
    }

    fn write_at(&self, lsn: Lsn, bytes: &[u8]) -> DbResult<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.phys(lsn)))?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn read_at(&self, lsn: Lsn, len: usize) -> DbResult<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.phys(lsn)))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Append a record body; returns its address.
    pub fn append(&self, body: &[u8]) -> DbResult<Lsn> {
        let need = (record::FRAME_OVERHEAD + body.len()) as u64;
        let mut st = self.state.lock().unwrap();
        let tail = self.tail(st.end);
        let pad = if tail < need { tail } else { 0 };
        if st.end - st.start + pad + need > self.capacity {
            return Err(DbError::LogExhausted(format!(
                "redo log full: {} bytes needed, {} remaining",
                pad + need,
                self.capacity - (st.end - st.start)
            )));
        }
        if pad > 0 {
            if tail >= 4 {
                self.write_at(st.end, &0u32.to_le_bytes())?;
            }
            st.end += pad;
        }
        let lsn = st.end;
        self.write_at(lsn, &record::frame(lsn, body))?;
        st.end += need;
        Ok(lsn)
    }

    pub fn flush_to(&self, lsn: Lsn) -> DbResult<()> {
        let target = {
            let st = self.state.lock().unwrap();
            if st.flushed >= lsn {
                return Ok(());
            }
            st.end
        };
        self.file.lock().unwrap().sync_data()?;
        let mut st = self.state.lock().unwrap();
        if target > st.flushed {
            st.flushed = target;
        }
        Ok(())
    }

    pub fn end_of_log(&self) -> Lsn {
        self.state.lock().unwrap().end
    }

    pub fn start_of_log(&self) -> Lsn {
        self.state.lock().unwrap().start
    }

    pub fn get_remaining(&self) -> u64 {
        let st = self.state.lock().unwrap();
        self.capacity - (st.end - st.start)
    }

    /// Garbage-collect: space below `lsn` may be reused. Never moves back.
    pub fn move_firewall_to(&self, lsn: Lsn) {
        let mut st = self.state.lock().unwrap();
        let clamped = lsn.min(st.end);
        if clamped > st.start {
            debug!(from = st.start, to = clamped, "redo firewall moved");
            st.start = clamped;
        }
    }

    /// Restart only: the dirty-page table may need records older than the
    /// master checkpoint.
    pub fn rewind_firewall_to(&self, lsn: Lsn) {
        let mut st = self.state.lock().unwrap();
        if lsn < st.start {
            st.start = lsn;
        }
    }

    /// Scan forward from `master` to find the durable end of the log.
    pub fn recover_bounds(&self, master: Lsn) -> DbResult<Lsn> {
        if master == 0 {
            let mut st = self.state.lock().unwrap();
            st.start = 1;
            st.end = 1;
            st.flushed = 1;
            return Ok(1);
        }
        let mut lsn = master;
        let mut end = master;
        loop {
            let tail = self.tail(lsn);
            if tail < MIN_FRAME {
                lsn += tail;
                continue;
            }
            let head = self.read_at(lsn, 4)?;
            let len = u32::from_le_bytes(head[..4].try_into().unwrap()) as u64;
            if len == 0 {
                lsn += tail;
                continue;
            }
            if len < MIN_FRAME || len > tail {
                break;
            }
            let bytes = self.read_at(lsn, len as usize)?;
            if record::read_frame(&bytes, lsn).is_none() {
                break;
            }
            lsn += len;
            end = lsn;
        }
        let mut st = self.state.lock().unwrap();
        st.start = master;
        st.end = end;
        st.flushed = end;
        info!(master, end, "recovered redo log bounds");
        Ok(end)
    }

    pub fn iter_from(&self, from: Lsn) -> RedoIter<'_> {
        RedoIter { log: self, lsn: from }
    }
}

/// Forward iterator over redo records in `[from, end_of_log)`.
pub struct RedoIter<'a> {
    log: &'a RedoLog,
    lsn: Lsn,
}

impl<'a> Iterator for RedoIter<'a> {
    type Item = (Lsn, LogRecord);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let end = self.log.end_of_log();
            if self.lsn >= end {
                return None;
            }
            let tail = self.log.tail(self.lsn);
            if tail < MIN_FRAME {
                self.lsn += tail;
                continue;
            }
            let head = self.log.read_at(self.lsn, 4).ok()?;
            let len = u32::from_le_bytes(head[..4].try_into().unwrap()) as u64;
            if len == 0 {
                self.lsn += tail;
                continue;
            }
            if len < MIN_FRAME || len > tail {
                return None;
            }
            let bytes = self.log.read_at(self.lsn, len as usize).ok()?;
            let (body, _) = record::read_frame(&bytes, self.lsn)?;
            let rec = LogRecord::from_bytes(&body).ok()?;
            let at = self.lsn;
            self.lsn += len;
            return Some((at, rec));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::RecordKind;
    use tempfile::tempdir;

    fn rec(tx: u64) -> Vec<u8> {
        let mut r = LogRecord::new(RecordKind::Update);
        r.tx_id = tx;
        r.to_bytes()
    }

    #[test]
    fn test_append_and_iterate() {
        let dir = tempdir().unwrap();
        let log = RedoLog::open(&dir.path().join("redo.log"), 4096).unwrap();
        let a = log.append(&rec(1)).unwrap();
        let b = log.append(&rec(2)).unwrap();
        assert!(b > a);
        let ids: Vec<u64> = log.iter_from(a).map(|(_, r)| r.tx_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_wraps_without_splitting_records() {
        let dir = tempdir().unwrap();
        let cap = 1024u64;
        let log = RedoLog::open(&dir.path().join("redo.log"), cap).unwrap();
        let mut last = 0;
        for i in 0..20u64 {
            // keep firewall chasing the tail so space never runs out
            let lsn = log.append(&rec(i)).unwrap();
            log.move_firewall_to(lsn);
            last = lsn;
        }
        assert!(last > cap, "log should have wrapped");
        let got: Vec<u64> = log.iter_from(last).map(|(_, r)| r.tx_id).collect();
        assert_eq!(got, vec![19]);
    }

    #[test]
    fn test_exhaustion() {
        let dir = tempdir().unwrap();
        let log = RedoLog::open(&dir.path().join("redo.log"), 256).unwrap();
        let mut hit = false;
        for i in 0..10u64 {
            if log.append(&rec(i)).is_err() {
                hit = true;
                break;
            }
        }
        assert!(hit, "append without firewall movement must exhaust");
    }

    #[test]
    fn test_recover_bounds_finds_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let first;
        let last;
        {
            let log = RedoLog::open(&path, 4096).unwrap();
            first = log.append(&rec(1)).unwrap();
            log.append(&rec(2)).unwrap();
            last = log.append(&rec(3)).unwrap();
            log.flush_to(last).unwrap();
        }
        let log = RedoLog::open(&path, 4096).unwrap();
        let end = log.recover_bounds(first).unwrap();
        assert!(end > last);
        let ids: Vec<u64> = log.iter_from(first).map(|(_, r)| r.tx_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
