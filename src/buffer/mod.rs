use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use linked_hash_map::LinkedHashMap;
use tracing::{debug, warn};

use crate::common::{DbError, DbResult};
use crate::config::BUFFER_RETRIES;
use crate::log::{LogManager, Lsn, NULL_LSN};
use crate::storage::{FilePage, FileSet, Page};

pub mod version;
pub use version::PageView;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

/// Eviction hint attached at unpin time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Affinity {
    Loved,
    Liked,
    Hated,
}

/// Write-ahead enforcement seam. The live delegate flushes the log; during
/// restart redo the recovery manager substitutes a vacuous one because the
/// log is already on disk.
pub trait WriteAhead: Send + Sync {
    fn flush_to(&self, lsn: Lsn) -> DbResult<()>;
}

impl WriteAhead for LogManager {
    fn flush_to(&self, lsn: Lsn) -> DbResult<()> {
        LogManager::flush_to(self, lsn)
    }
}

/// Used while the recovery manager replays the log.
pub struct NoWriteAhead;

impl WriteAhead for NoWriteAhead {
    fn flush_to(&self, _lsn: Lsn) -> DbResult<()> {
        Ok(())
    }
}

struct FrameMeta {
    readers: u32,
    writer: bool,
    pin_count: u32,
    io: bool,
    dead: bool,
    dirty: bool,
    rec_lsn: Lsn,
    end_lsn: Lsn,
    affinity: Affinity,
    temp_tx: Option<u64>,
}

struct Frame {
    id: FilePage,
    meta: Mutex<FrameMeta>,
    cond: Condvar,
    page: RwLock<Page>,
}

impl Frame {
    fn new(id: FilePage) -> Self {
        Frame {
            id,
            meta: Mutex::new(FrameMeta {
                readers: 0,
                writer: false,
                pin_count: 0,
                io: false,
                dead: false,
                dirty: false,
                rec_lsn: NULL_LSN,
                end_lsn: NULL_LSN,
                affinity: Affinity::Liked,
                temp_tx: None,
            }),
            cond: Condvar::new(),
            page: RwLock::new(Page::new()),
        }
    }
}

struct PoolShared {
    capacity: usize,
    frames: Mutex<LinkedHashMap<FilePage, Arc<Frame>>>,
    free_cond: Condvar,
    files: Arc<FileSet>,
    wal: RwLock<Arc<dyn WriteAhead>>,
    /// Wired after construction; decides whether temp frames may be
    /// discarded at eviction.
    txs: std::sync::OnceLock<Arc<crate::tx::pool::TxPool>>,
}

/// A latched pin on a buffered page. The latch is held from pin to unpin;
/// `page()`/`page_mut()` give scoped access to the bytes. Dropping the
/// handle releases the latch (explicit `unpin*` records the affinity and,
/// for dirty unpins, the WAL end-LSN).
pub struct PinnedPage {
    frame: Arc<Frame>,
    shared: Arc<PoolShared>,
    mode: LatchMode,
    released: bool,
}

impl PinnedPage {
    pub fn id(&self) -> FilePage {
        self.frame.id
    }

    pub fn mode(&self) -> LatchMode {
        self.mode
    }

    pub fn page(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read().unwrap()
    }

    pub fn page_mut(&self) -> RwLockWriteGuard<'_, Page> {
        debug_assert_eq!(self.mode, LatchMode::Exclusive, "mutating a shared pin");
        self.frame.page.write().unwrap()
    }

    pub fn lsn(&self) -> Lsn {
        self.page().lsn()
    }

    fn release(&mut self, affinity: Affinity) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut meta = self.frame.meta.lock().unwrap();
            match self.mode {
                LatchMode::Shared => meta.readers -= 1,
                LatchMode::Exclusive => meta.writer = false,
            }
            meta.pin_count -= 1;
            meta.affinity = affinity;
        }
        self.frame.cond.notify_all();
        self.shared.free_cond.notify_all();
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.release(Affinity::Liked);
    }
}

/// The pinned page cache. Bounded frame set with LRU ordering; eviction of
/// a dirty frame first forces the log to the frame's end-LSN (the WAL
/// invariant), then writes the page.
pub struct BufferPool {
    shared: Arc<PoolShared>,
    log: Arc<LogManager>,
}

impl BufferPool {
    pub fn new(capacity: usize, files: Arc<FileSet>, log: Arc<LogManager>) -> Self {
        let wal: Arc<dyn WriteAhead> = log.clone();
        BufferPool {
            shared: Arc::new(PoolShared {
                capacity,
                frames: Mutex::new(LinkedHashMap::new()),
                free_cond: Condvar::new(),
                files,
                wal: RwLock::new(wal),
                txs: std::sync::OnceLock::new(),
            }),
            log,
        }
    }

    /// Swap the WAL delegate. Restart recovery installs `NoWriteAhead`.
    pub fn set_write_ahead(&self, delegate: Arc<dyn WriteAhead>) {
        *self.shared.wal.write().unwrap() = delegate;
    }

    pub fn attach_tx_pool(&self, pool: Arc<crate::tx::pool::TxPool>) {
        let _ = self.shared.txs.set(pool);
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// Pin an existing page, reading it from disk on a miss.
    pub fn pin(&self, id: FilePage, mode: LatchMode) -> DbResult<PinnedPage> {
        self.pin_inner(id, mode, false, None)
    }

    /// Pin without a disk read; contents start zeroed with the page LSNs
    /// seeded from the current end of log.
    pub fn pin_new(&self, id: FilePage) -> DbResult<PinnedPage> {
        let pinned = self.pin_inner(id, LatchMode::Exclusive, true, None)?;
        {
            let mut page = pinned.page_mut();
            *page = Page::new();
            page.set_lsn(self.log.end_of_log());
            page.set_first_lsn(self.log.stability_point());
        }
        Ok(pinned)
    }

    /// Pin whose frame is discarded at eviction if `tx` has committed by
    /// then, instead of being flushed.
    pub fn pin_temp(&self, id: FilePage, tx_id: u64, mode: LatchMode) -> DbResult<PinnedPage> {
        self.pin_inner(id, mode, false, Some(tx_id))
    }

    fn pin_inner(
        &self,
        id: FilePage,
        mode: LatchMode,
        fresh: bool,
        temp_tx: Option<u64>,
    ) -> DbResult<PinnedPage> {
        for _ in 0..BUFFER_RETRIES {
            let frame = match self.lookup_or_load(id, fresh)? {
                Some(f) => f,
                None => {
                    // pool full of pinned frames; wait for an unpin
                    let frames = self.shared.frames.lock().unwrap();
                    let _ = self
                        .shared
                        .free_cond
                        .wait_timeout(frames, Duration::from_millis(50))
                        .unwrap();
                    continue;
                }
            };
            if !self.latch(&frame, mode) {
                continue; // frame died while we waited
            }
            if let Some(tx) = temp_tx {
                frame.meta.lock().unwrap().temp_tx = Some(tx);
            }
            return Ok(PinnedPage {
                frame,
                shared: self.shared.clone(),
                mode,
                released: false,
            });
        }
        warn!(page = %id, "buffer pool exhausted");
        Err(DbError::BufferNotFound)
    }

    fn lookup_or_load(&self, id: FilePage, fresh: bool) -> DbResult<Option<Arc<Frame>>> {
        let mut frames = self.shared.frames.lock().unwrap();
        if let Some(f) = frames.get_refresh(&id) {
            return Ok(Some(f.clone()));
        }
        if frames.len() >= self.shared.capacity && !self.evict_one(&mut frames)? {
            return Ok(None);
        }
        let frame = Arc::new(Frame::new(id));
        {
            let mut meta = frame.meta.lock().unwrap();
            meta.io = !fresh;
        }
        frames.insert(id, frame.clone());
        drop(frames);
        if !fresh {
            let res = self
                .shared
                .files
                .get(id.file_id)
                .and_then(|f| f.read_page(id.page_id, &mut frame.page.write().unwrap()));
            let mut meta = frame.meta.lock().unwrap();
            meta.io = false;
            if let Err(e) = res {
                meta.dead = true;
                drop(meta);
                self.shared.frames.lock().unwrap().remove(&id);
                frame.cond.notify_all();
                return Err(e);
            }
            drop(meta);
            frame.cond.notify_all();
        }
        Ok(Some(frame))
    }

    /// Acquire the latch in `mode`; false if the frame was discarded.
    fn latch(&self, frame: &Arc<Frame>, mode: LatchMode) -> bool {
        let mut meta = frame.meta.lock().unwrap();
        loop {
            if meta.dead {
                return false;
            }
            if !meta.io {
                match mode {
                    LatchMode::Shared if !meta.writer => {
                        meta.readers += 1;
                        meta.pin_count += 1;
                        return true;
                    }
                    LatchMode::Exclusive if !meta.writer && meta.readers == 0 => {
                        meta.writer = true;
                        meta.pin_count += 1;
                        return true;
                    }
                    _ => {}
                }
            }
            meta = frame.cond.wait(meta).unwrap();
        }
    }

    /// Evict one unpinned frame, preferring HATED ones. Called with the
    /// frame map locked. Returns false when every frame is pinned.
    fn evict_one(&self, frames: &mut LinkedHashMap<FilePage, Arc<Frame>>) -> DbResult<bool> {
        let mut victim: Option<FilePage> = None;
        for pass in 0..2 {
            for (id, frame) in frames.iter() {
                let meta = frame.meta.lock().unwrap();
                if meta.pin_count == 0 && !meta.io && !meta.dead {
                    if pass == 0 && meta.affinity != Affinity::Hated {
                        continue;
                    }
                    victim = Some(*id);
                    break;
                }
            }
            if victim.is_some() {
                break;
            }
        }
        let Some(id) = victim else {
            return Ok(false);
        };
        let frame = frames.remove(&id).unwrap();
        let mut meta = frame.meta.lock().unwrap();
        meta.dead = true;
        // a temp frame whose owner committed holds only disposable bytes
        let discard = match (meta.temp_tx, self.shared.txs.get()) {
            (Some(tx), Some(pool)) => pool.master_committed(tx),
            _ => false,
        };
        if meta.dirty && !discard {
            let end_lsn = meta.end_lsn;
            drop(meta);
            // WAL: the log must reach the frame's end-LSN before the write
            self.shared.wal.read().unwrap().flush_to(end_lsn)?;
            let page = frame.page.read().unwrap();
            self.shared.files.get(id.file_id)?.write_page(id.page_id, &page)?;
            debug!(page = %id, end_lsn, "evicted dirty frame");
        } else {
            drop(meta);
        }
        frame.cond.notify_all();
        Ok(true)
    }

    /// Release the latch. The affinity orders future eviction.
    pub fn unpin(&self, mut pinned: PinnedPage, affinity: Affinity) {
        pinned.release(affinity);
    }

    /// Mark a still-pinned frame dirty. `end_lsn` is the LSN of the newest
    /// record whose effect is on the frame; the recovery LSN is pinned at
    /// the first dirtying since the frame was last clean.
    pub fn mark_dirty(&self, pinned: &PinnedPage, end_lsn: Lsn) {
        let mut meta = pinned.frame.meta.lock().unwrap();
        if !meta.dirty {
            meta.dirty = true;
            meta.rec_lsn = end_lsn;
        }
        if end_lsn > meta.end_lsn {
            meta.end_lsn = end_lsn;
        }
    }

    /// Release the latch and mark the frame dirty in one step.
    pub fn unpin_dirty(&self, mut pinned: PinnedPage, affinity: Affinity, end_lsn: Lsn) {
        self.mark_dirty(&pinned, end_lsn);
        pinned.release(affinity);
    }

    /// Write out as many dirty frames as possible without blocking on
    /// latched frames. Returns the frames still dirty, with their recovery
    /// LSNs, for the end-of-checkpoint record.
    pub fn checkpoint(&self) -> DbResult<Vec<(FilePage, Lsn)>> {
        let snapshot: Vec<Arc<Frame>> = {
            let frames = self.shared.frames.lock().unwrap();
            frames.values().cloned().collect()
        };
        let mut remaining = Vec::new();
        for frame in snapshot {
            let mut meta = frame.meta.lock().unwrap();
            if !meta.dirty || meta.dead {
                continue;
            }
            if meta.writer || meta.io {
                remaining.push((frame.id, meta.rec_lsn));
                continue;
            }
            // take a shared latch so no writer slips in during the write
            meta.readers += 1;
            meta.pin_count += 1;
            let end_lsn = meta.end_lsn;
            drop(meta);
            let res = (|| -> DbResult<()> {
                self.shared.wal.read().unwrap().flush_to(end_lsn)?;
                let page = frame.page.read().unwrap();
                self.shared
                    .files
                    .get(frame.id.file_id)?
                    .write_page(frame.id.page_id, &page)
            })();
            let mut meta = frame.meta.lock().unwrap();
            meta.readers -= 1;
            meta.pin_count -= 1;
            match res {
                Ok(()) => {
                    meta.dirty = false;
                    meta.rec_lsn = NULL_LSN;
                    meta.end_lsn = NULL_LSN;
                }
                Err(e) => {
                    warn!(page = %frame.id, error = %e, "checkpoint write failed");
                    remaining.push((frame.id, meta.rec_lsn));
                }
            }
            drop(meta);
            frame.cond.notify_all();
            self.shared.free_cond.notify_all();
        }
        Ok(remaining)
    }

    /// Drop a frame without writing it. Only for pages being deallocated.
    pub fn discard(&self, id: FilePage) {
        if let Some(frame) = self.shared.frames.lock().unwrap().remove(&id) {
            frame.meta.lock().unwrap().dead = true;
            frame.cond.notify_all();
        }
        self.shared.free_cond.notify_all();
    }

    #[cfg(test)]
    fn frame_count(&self) -> usize {
        self.shared.frames.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DbFile;
    use std::thread;
    use tempfile::tempdir;

    fn setup(frames: usize, pages: u32) -> (tempfile::TempDir, BufferPool) {
        let dir = tempdir().unwrap();
        let files = Arc::new(FileSet::new());
        let f = Arc::new(DbFile::open_or_create(&dir.path().join("t.db"), 0).unwrap());
        f.extend_to(pages).unwrap();
        files.register(f);
        let log = Arc::new(LogManager::open(dir.path(), 1024 * 1024, 1).unwrap());
        let pool = BufferPool::new(frames, files, log);
        (dir, pool)
    }

    #[test]
    fn test_pin_new_then_reread() {
        let (_dir, pool) = setup(4, 8);
        let id = FilePage::new(0, 3);
        let p = pool.pin_new(id).unwrap();
        p.page_mut().bytes_mut()[100] = 7;
        pool.unpin_dirty(p, Affinity::Liked, 1);
        let p = pool.pin(id, LatchMode::Shared).unwrap();
        assert_eq!(p.page().bytes()[100], 7);
        pool.unpin(p, Affinity::Liked);
    }

    #[test]
    fn test_eviction_writes_dirty_frames() {
        let (_dir, pool) = setup(2, 8);
        for i in 0..4u32 {
            let id = FilePage::new(0, i);
            let p = pool.pin_new(id).unwrap();
            p.page_mut().bytes_mut()[50] = i as u8 + 1;
            pool.unpin_dirty(p, Affinity::Hated, 1);
        }
        assert!(pool.frame_count() <= 2);
        // the evicted pages must have reached disk
        for i in 0..4u32 {
            let p = pool.pin(FilePage::new(0, i), LatchMode::Shared).unwrap();
            assert_eq!(p.page().bytes()[50], i as u8 + 1);
            pool.unpin(p, Affinity::Liked);
        }
    }

    #[test]
    fn test_exclusive_excludes_shared() {
        let (_dir, pool) = setup(4, 8);
        let pool = Arc::new(pool);
        let id = FilePage::new(0, 1);
        let w = pool.pin_new(id).unwrap();
        w.page_mut().bytes_mut()[10] = 9;

        let p2 = pool.clone();
        let h = thread::spawn(move || {
            let r = p2.pin(id, LatchMode::Shared).unwrap();
            let v = r.page().bytes()[10];
            p2.unpin(r, Affinity::Liked);
            v
        });
        thread::sleep(Duration::from_millis(50));
        pool.unpin_dirty(w, Affinity::Liked, 1);
        // the reader must have observed the completed write
        assert_eq!(h.join().unwrap(), 9);
    }

    #[test]
    fn test_checkpoint_skips_latched() {
        let (_dir, pool) = setup(4, 8);
        let a = pool.pin_new(FilePage::new(0, 1)).unwrap();
        a.page_mut().bytes_mut()[0] = 1;
        pool.unpin_dirty(a, Affinity::Liked, 5);
        let held = pool.pin_new(FilePage::new(0, 2)).unwrap();
        held.page_mut().bytes_mut()[0] = 2;

        let remaining = pool.checkpoint().unwrap();
        // page 1 flushed; page 2 is exclusively latched and not yet dirty
        assert!(remaining.is_empty());
        pool.unpin_dirty(held, Affinity::Liked, 6);
        let remaining = pool.checkpoint().unwrap();
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_pin_temp_discards_after_owner_commit() {
        let (_dir, pool) = setup(2, 8);
        let txs = Arc::new(crate::tx::pool::TxPool::new(1));
        pool.attach_tx_pool(txs.clone());
        let t = txs.begin(false, 0).unwrap();
        let id = FilePage::new(0, 1);
        {
            let p = pool.pin_new(id).unwrap();
            p.page_mut().bytes_mut()[99] = 7;
            pool.unpin_dirty(p, Affinity::Liked, 1);
        }
        let p = pool.pin_temp(id, t.id, LatchMode::Shared).unwrap();
        pool.unpin(p, Affinity::Hated);
        txs.end(&t);
        // force eviction of the temp frame
        for i in 2..6u32 {
            let q = pool.pin_new(FilePage::new(0, i)).unwrap();
            pool.unpin_dirty(q, Affinity::Liked, 1);
        }
        // the temp frame was discarded, not flushed
        let p = pool.pin(id, LatchMode::Shared).unwrap();
        assert_eq!(p.page().bytes()[99], 0);
        pool.unpin(p, Affinity::Liked);
    }

    #[test]
    fn test_rec_lsn_pins_first_dirty() {
        let (_dir, pool) = setup(4, 8);
        let id = FilePage::new(0, 1);
        let p = pool.pin_new(id).unwrap();
        pool.unpin_dirty(p, Affinity::Liked, 10);
        let p = pool.pin(id, LatchMode::Exclusive).unwrap();
        pool.unpin_dirty(p, Affinity::Liked, 20);
        let frames = pool.shared.frames.lock().unwrap();
        let meta = frames.get(&id).unwrap().meta.lock().unwrap();
        assert_eq!(meta.rec_lsn, 10);
        assert_eq!(meta.end_lsn, 20);
    }
}
