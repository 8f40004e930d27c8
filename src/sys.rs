use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use fs2::FileExt;
use tracing::info;

use crate::common::{DbError, DbResult};
use crate::config::{FORMAT_VERSION, PAGE_SIZE};
use crate::log::{Lsn, NULL_LSN};

const MAGIC: u32 = 0x4b424443; // "CDBK"

/// Contents of the system key page.
#[derive(Clone, Debug)]
pub struct SysKeyData {
    /// LSN of the last durable BEGIN_CHECKPOINT; restart analysis scans
    /// from here.
    pub master: Lsn,
    pub next_tx_id: u64,
    /// Min first_lsn of the transactions active at the checkpoint.
    pub commit_lsn: Lsn,
    /// Base address of the undo log after its last reclamation.
    pub undo_base: Lsn,
    /// Recorded size of each database file, in pages.
    pub file_pages: Vec<(u16, u32)>,
    /// Registered segment method types: byte code to method name.
    pub registry: Vec<(u8, String)>,
}

impl Default for SysKeyData {
    fn default() -> Self {
        SysKeyData {
            master: NULL_LSN,
            next_tx_id: 1,
            commit_lsn: NULL_LSN,
            undo_base: 1,
            file_pages: Vec::new(),
            registry: Vec::new(),
        }
    }
}

/// The force-written single-page system key file. Every checkpoint and
/// every segment-type registration rewrites and fsyncs it; the checkpoint
/// is complete only once this write is durable.
pub struct SystemKey {
    file: Mutex<File>,
    data: Mutex<SysKeyData>,
}

impl SystemKey {
    /// Open or create. Returns the handle and whether the file was fresh.
    pub fn open(path: &Path) -> DbResult<(Self, bool)> {
        let exists = path.exists() && path.metadata().map(|m| m.len() > 0).unwrap_or(false);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| DbError::Database(format!("{} is in use", path.display())))?;
        let data = if exists {
            let mut buf = vec![0u8; PAGE_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            Self::decode(&buf)?
        } else {
            SysKeyData::default()
        };
        let key = SystemKey {
            file: Mutex::new(file),
            data: Mutex::new(data),
        };
        if !exists {
            key.force_write()?;
            info!(path = %path.display(), "initialized system key");
        }
        Ok((key, !exists))
    }

    pub fn snapshot(&self) -> SysKeyData {
        self.data.lock().unwrap().clone()
    }

    /// Mutate and force-write in one step.
    pub fn update(&self, f: impl FnOnce(&mut SysKeyData)) -> DbResult<()> {
        {
            let mut data = self.data.lock().unwrap();
            f(&mut data);
        }
        self.force_write()
    }

    pub fn force_write(&self) -> DbResult<()> {
        let buf = {
            let data = self.data.lock().unwrap();
            Self::encode(&data)
        };
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    fn encode(data: &SysKeyData) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        buf.extend(&MAGIC.to_le_bytes());
        buf.extend(&FORMAT_VERSION.to_le_bytes());
        buf.extend(&0u32.to_le_bytes()); // length placeholder
        buf.extend(&data.master.to_le_bytes());
        buf.extend(&data.next_tx_id.to_le_bytes());
        buf.extend(&data.commit_lsn.to_le_bytes());
        buf.extend(&data.undo_base.to_le_bytes());
        buf.extend(&(data.file_pages.len() as u16).to_le_bytes());
        for (id, pages) in &data.file_pages {
            buf.extend(&id.to_le_bytes());
            buf.extend(&pages.to_le_bytes());
        }
        buf.extend(&(data.registry.len() as u16).to_le_bytes());
        for (code, name) in &data.registry {
            buf.push(*code);
            buf.extend(&(name.len() as u16).to_le_bytes());
            buf.extend(name.as_bytes());
        }
        let len = buf.len() as u32 + 4;
        buf[8..12].copy_from_slice(&len.to_le_bytes());
        let crc = crc32fast::hash(&buf);
        buf.extend(&crc.to_le_bytes());
        assert!(buf.len() <= PAGE_SIZE, "system key overflows its page");
        buf.resize(PAGE_SIZE, 0);
        buf
    }

    fn decode(buf: &[u8]) -> DbResult<SysKeyData> {
        let bad = |m: &str| DbError::Database(format!("system key: {}", m));
        if buf.len() < 16 || u32::from_le_bytes(buf[..4].try_into().unwrap()) != MAGIC {
            return Err(bad("bad magic"));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(DbError::Database(format!(
                "format version {} does not match {}",
                version, FORMAT_VERSION
            )));
        }
        let len = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        if len < 16 || len > buf.len() {
            return Err(bad("bad length"));
        }
        let stored = u32::from_le_bytes(buf[len - 4..len].try_into().unwrap());
        if crc32fast::hash(&buf[..len - 4]) != stored {
            return Err(bad("checksum mismatch"));
        }
        let u64_at = |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        let master = u64_at(12);
        let next_tx_id = u64_at(20);
        let commit_lsn = u64_at(28);
        let undo_base = u64_at(36);
        let mut off = 44;
        let nfiles = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap()) as usize;
        off += 2;
        let mut file_pages = Vec::with_capacity(nfiles);
        for _ in 0..nfiles {
            let id = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap());
            let pages = u32::from_le_bytes(buf[off + 2..off + 6].try_into().unwrap());
            file_pages.push((id, pages));
            off += 6;
        }
        let nreg = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap()) as usize;
        off += 2;
        let mut registry = Vec::with_capacity(nreg);
        for _ in 0..nreg {
            let code = buf[off];
            let nlen = u16::from_le_bytes(buf[off + 1..off + 3].try_into().unwrap()) as usize;
            off += 3;
            let name = String::from_utf8(buf[off..off + nlen].to_vec())
                .map_err(|_| bad("bad method name"))?;
            registry.push((code, name));
            off += nlen;
        }
        Ok(SysKeyData {
            master,
            next_tx_id,
            commit_lsn,
            undo_base,
            file_pages,
            registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sys.key");
        {
            let (key, created) = SystemKey::open(&path).unwrap();
            assert!(created);
            key.update(|d| {
                d.master = 77;
                d.next_tx_id = 10;
                d.file_pages = vec![(0, 1024)];
                d.registry = vec![(3, "dataset".to_string()), (4, "tree".to_string())];
            })
            .unwrap();
        }
        let (key, created) = SystemKey::open(&path).unwrap();
        assert!(!created);
        let d = key.snapshot();
        assert_eq!(d.master, 77);
        assert_eq!(d.next_tx_id, 10);
        assert_eq!(d.file_pages, vec![(0, 1024)]);
        assert_eq!(d.registry[1], (4, "tree".to_string()));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sys.key");
        {
            let (_key, _) = SystemKey::open(&path).unwrap();
        }
        // corrupt the stored version
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4] = 0xEE;
        std::fs::write(&path, &bytes).unwrap();
        assert!(SystemKey::open(&path).is_err());
    }

    #[test]
    fn test_corruption_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sys.key");
        {
            let (key, _) = SystemKey::open(&path).unwrap();
            key.update(|d| d.master = 5).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[20] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(SystemKey::open(&path).is_err());
    }
}
