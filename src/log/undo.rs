use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use fs2::FileExt;
use tracing::{debug, info};

use crate::common::{DbError, DbResult};
use crate::log::record::{self, LogRecord};
use crate::log::Lsn;

const MAGIC: u32 = 0x55424443; // "CDBU"
const HEADER: u64 = 8;

struct UndoState {
    /// Address of the first byte physically present. Persisted in sys.key
    /// so addresses stay stable across reclamation.
    base: Lsn,
    /// Next address to be assigned.
    end: Lsn,
    /// Records below this address are no longer needed by any transaction
    /// or version read.
    min_undo: Lsn,
}

/// The undo log: an append-only byte stream read by direct address. Unlike
/// the redo log it never wraps; space is reclaimed from the front once every
/// retained record is behind `min_undo`.
pub struct UndoLog {
    file: Mutex<File>,
    state: Mutex<UndoState>,
}

impl UndoLog {
    pub fn open(path: &Path, base: Lsn) -> DbResult<Self> {
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| DbError::Database(format!("{} is in use", path.display())))?;
        let base = if !exists || file.metadata()?.len() < HEADER {
            file.set_len(0)?;
            file.write_all(&MAGIC.to_le_bytes())?;
            file.write_all(&[0u8; 4])?;
            file.sync_all()?;
            info!(path = %path.display(), "initialized undo log");
            if base == 0 { 1 } else { base }
        } else {
            let mut magic = [0u8; 4];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut magic)?;
            if u32::from_le_bytes(magic) != MAGIC {
                return Err(DbError::Database("invalid undo log header".to_string()));
            }
            if base == 0 { 1 } else { base }
        };
        let end = base + file.metadata()?.len().saturating_sub(HEADER);
        Ok(UndoLog {
            file: Mutex::new(file),
            state: Mutex::new(UndoState {
                base,
                end,
                min_undo: base,
            }),
        })
    }

    pub fn base(&self) -> Lsn {
        self.state.lock().unwrap().base
    }

    /// The address the next append will receive.
    pub fn next_addr(&self) -> Lsn {
        self.state.lock().unwrap().end
    }

    pub fn append(&self, body: &[u8]) -> DbResult<Lsn> {
        let mut st = self.state.lock().unwrap();
        let addr = st.end;
        let framed = record::frame(addr, body);
        let phys = HEADER + (addr - st.base);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(phys))?;
        file.write_all(&framed)?;
        st.end += framed.len() as u64;
        Ok(addr)
    }

    pub fn read_at(&self, addr: Lsn) -> DbResult<LogRecord> {
        let (base, end) = {
            let st = self.state.lock().unwrap();
            (st.base, st.end)
        };
        if addr < base || addr >= end {
            return Err(DbError::Storage(format!(
                "undo address {} outside [{}, {})",
                addr, base, end
            )));
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(HEADER + (addr - base)))?;
        let mut head = [0u8; 4];
        file.read_exact(&mut head)?;
        let len = u32::from_le_bytes(head) as usize;
        if (len as u64) < record::MIN_FRAME || addr + len as u64 > end {
            return Err(DbError::Storage(format!("bad undo frame at {}", addr)));
        }
        let mut buf = vec![0u8; len];
        buf[..4].copy_from_slice(&head);
        file.read_exact(&mut buf[4..])?;
        drop(file);
        let (body, _) = record::read_frame(&buf, addr)
            .ok_or_else(|| DbError::Storage(format!("corrupt undo frame at {}", addr)))?;
        LogRecord::from_bytes(&body)
    }

    pub fn flush(&self) -> DbResult<()> {
        self.file.lock().unwrap().sync_data()?;
        Ok(())
    }

    pub fn set_min_undo(&self, addr: Lsn) {
        let mut st = self.state.lock().unwrap();
        if addr > st.min_undo {
            st.min_undo = addr.min(st.end);
        }
    }

    /// Physically reclaim when nothing live remains. Returns the new base,
    /// which the caller persists in sys.key.
    pub fn try_reclaim(&self) -> DbResult<Lsn> {
        let mut st = self.state.lock().unwrap();
        if st.min_undo >= st.end && st.base < st.end {
            let file = self.file.lock().unwrap();
            file.set_len(HEADER)?;
            file.sync_data()?;
            debug!(from = st.base, to = st.end, "undo log reclaimed");
            st.base = st.end;
        }
        Ok(st.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::RecordKind;
    use tempfile::tempdir;

    #[test]
    fn test_addressable_reads() {
        let dir = tempdir().unwrap();
        let log = UndoLog::open(&dir.path().join("undo.log"), 1).unwrap();
        let mut addrs = Vec::new();
        for i in 0..4u64 {
            let mut r = LogRecord::new(RecordKind::Update);
            r.tx_id = i;
            addrs.push(log.append(&r.to_bytes()).unwrap());
        }
        // read back out of order
        assert_eq!(log.read_at(addrs[2]).unwrap().tx_id, 2);
        assert_eq!(log.read_at(addrs[0]).unwrap().tx_id, 0);
        assert!(log.read_at(addrs[3] + 1).is_err());
    }

    #[test]
    fn test_reopen_preserves_addresses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("undo.log");
        let addr;
        {
            let log = UndoLog::open(&path, 1).unwrap();
            let mut r = LogRecord::new(RecordKind::Update);
            r.tx_id = 42;
            addr = log.append(&r.to_bytes()).unwrap();
            log.flush().unwrap();
        }
        let log = UndoLog::open(&path, 1).unwrap();
        assert_eq!(log.read_at(addr).unwrap().tx_id, 42);
    }

    #[test]
    fn test_reclaim_only_when_drained() {
        let dir = tempdir().unwrap();
        let log = UndoLog::open(&dir.path().join("undo.log"), 1).unwrap();
        let mut r = LogRecord::new(RecordKind::Update);
        r.tx_id = 1;
        let a = log.append(&r.to_bytes()).unwrap();
        log.set_min_undo(a);
        // a record at `a` is still retained: base must not move
        assert_eq!(log.try_reclaim().unwrap(), 1);
        log.set_min_undo(log.next_addr());
        let base = log.try_reclaim().unwrap();
        assert_eq!(base, log.next_addr());
    }
}
