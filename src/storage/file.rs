use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fs2::FileExt;
use tracing::debug;

use crate::common::{DbError, DbResult};
use crate::config::PAGE_SIZE;
use crate::storage::page::Page;

/// A page-granular database file. Holds an exclusive advisory lock for the
/// lifetime of the handle; the lock's presence is the "in-use" signal.
pub struct DbFile {
    file_id: u16,
    path: PathBuf,
    file: Mutex<File>,
    pages: AtomicU32,
}

impl DbFile {
    pub fn open_or_create(path: &Path, file_id: u16) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            DbError::Database(format!("file {} is in use", path.display()))
        })?;
        let pages = (file.metadata()?.len() / PAGE_SIZE as u64) as u32;
        debug!(file = %path.display(), pages, "opened database file");
        Ok(DbFile {
            file_id,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            pages: AtomicU32::new(pages),
        })
    }

    pub fn file_id(&self) -> u16 {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_count(&self) -> u32 {
        self.pages.load(Ordering::SeqCst)
    }

    pub fn read_page(&self, page_id: u32, page: &mut Page) -> DbResult<()> {
        if page_id >= self.page_count() {
            return Err(DbError::Storage(format!(
                "page {} out of bounds in file {}",
                page_id, self.file_id
            )));
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.read_exact(page.bytes_mut())?;
        Ok(())
    }

    pub fn write_page(&self, page_id: u32, page: &Page) -> DbResult<()> {
        if page_id >= self.page_count() {
            return Err(DbError::Storage(format!(
                "page {} out of bounds in file {}",
                page_id, self.file_id
            )));
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(page.bytes())?;
        Ok(())
    }

    pub fn sync(&self) -> DbResult<()> {
        self.file.lock().unwrap().sync_data()?;
        Ok(())
    }

    /// Grow the file to `pages`, zero-filled. No-op if already that large.
    pub fn extend_to(&self, pages: u32) -> DbResult<()> {
        let file = self.file.lock().unwrap();
        if pages > self.pages.load(Ordering::SeqCst) {
            file.set_len(pages as u64 * PAGE_SIZE as u64)?;
            file.sync_data()?;
            self.pages.store(pages, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for DbFile {
    fn drop(&mut self) {
        let _ = self.file.lock().unwrap().unlock();
    }
}

/// The set of open database files, keyed by file id.
pub struct FileSet {
    files: RwLock<HashMap<u16, Arc<DbFile>>>,
}

impl FileSet {
    pub fn new() -> Self {
        FileSet {
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, file: Arc<DbFile>) {
        self.files.write().unwrap().insert(file.file_id(), file);
    }

    pub fn get(&self, file_id: u16) -> DbResult<Arc<DbFile>> {
        self.files
            .read()
            .unwrap()
            .get(&file_id)
            .cloned()
            .ok_or_else(|| DbError::Storage(format!("unknown file id {}", file_id)))
    }

    pub fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.files.read().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn sync_all(&self) -> DbResult<()> {
        for (_, f) in self.files.read().unwrap().iter() {
            f.sync()?;
        }
        Ok(())
    }
}

impl Default for FileSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_page_io_roundtrip() {
        let dir = tempdir().unwrap();
        let f = DbFile::open_or_create(&dir.path().join("t.db"), 1).unwrap();
        f.extend_to(4).unwrap();
        let mut p = Page::new();
        p.bytes_mut()[100] = 0xAB;
        p.set_lsn(42);
        f.write_page(2, &p).unwrap();
        f.sync().unwrap();
        let mut q = Page::new();
        f.read_page(2, &mut q).unwrap();
        assert_eq!(q.bytes()[100], 0xAB);
        assert_eq!(q.lsn(), 42);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let dir = tempdir().unwrap();
        let f = DbFile::open_or_create(&dir.path().join("t.db"), 1).unwrap();
        f.extend_to(2).unwrap();
        let mut p = Page::new();
        assert!(f.read_page(2, &mut p).is_err());
        assert!(f.write_page(9, &p).is_err());
    }

    #[test]
    fn test_second_open_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let _a = DbFile::open_or_create(&path, 1).unwrap();
        assert!(DbFile::open_or_create(&path, 1).is_err());
    }

    #[test]
    fn test_fileset_lookup() {
        let dir = tempdir().unwrap();
        let set = FileSet::new();
        let f = Arc::new(DbFile::open_or_create(&dir.path().join("a.db"), 7).unwrap());
        set.register(f);
        assert!(set.get(7).is_ok());
        assert!(set.get(8).is_err());
        assert_eq!(set.ids(), vec![7]);
    }
}
