use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

use crate::buffer::BufferPool;
use crate::checkpoint::CheckpointWriter;
use crate::common::{DbError, DbResult};
use crate::config::{
    BUFFER_FRAMES, CHECKPOINT_INTERVAL, EXTENT_TABLE_PAGES, FREE_EXTENTS_PAGE, PAGE_HEADER_SIZE,
    REDO_CAPACITY, SEGMENT_CATALOG_PAGE, SYS_FILE_ID, SYS_FILE_PAGES, SYS_FIRST_FREE_PAGE,
    USED_EXTENTS_PAGE,
};
use crate::dataset::DatasetMethod;
use crate::btree::TreeMethod;
use crate::log::{LogManager, LogRecord};
use crate::recovery::RecoveryManager;
use crate::segment::{CatalogMethod, SegmentFactory, SpaceMethod, SEG_CATALOG, SEG_SPACE};
use crate::space::SpaceManager;
use crate::storage::page::{page_type, NONE_RAW};
use crate::storage::{DbFile, FilePage, FileSet, Page};
use crate::sys::SystemKey;
use crate::tx::deadlock::DeadlockDetector;
use crate::tx::logger::{TxLogger, UndoDispatch};
use crate::tx::pool::{Transaction, TxPool};

/// Open-time knobs that cannot be compile-time constants.
#[derive(Clone, Debug)]
pub struct Options {
    pub dir: PathBuf,
    pub buffer_frames: usize,
    pub redo_capacity: u64,
    pub checkpoint_interval: u64,
    pub initial_file_pages: u32,
}

impl Options {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Options {
            dir: dir.into(),
            buffer_frames: BUFFER_FRAMES,
            redo_capacity: REDO_CAPACITY,
            checkpoint_interval: CHECKPOINT_INTERVAL,
            initial_file_pages: SYS_FILE_PAGES,
        }
    }
}

/// The composed engine: every subsystem owned in one value, passed
/// explicitly. No global state.
pub struct Core {
    pub opts: Options,
    pub files: Arc<FileSet>,
    pub log: Arc<LogManager>,
    pub buffers: Arc<BufferPool>,
    pub pool: Arc<TxPool>,
    pub detector: Arc<DeadlockDetector>,
    pub txlog: Arc<TxLogger>,
    pub factory: Arc<SegmentFactory>,
    pub space: Arc<SpaceManager>,
    pub ckpt: Arc<CheckpointWriter>,
    pub syskey: Arc<SystemKey>,
}

impl UndoDispatch for Core {
    fn undo(&self, rec: &LogRecord, tx: &Arc<Transaction>) -> DbResult<()> {
        self.factory.method(rec.segment_type)?.undo(self, rec, tx)
    }
}

impl Core {
    pub fn as_dispatch(&self) -> &dyn UndoDispatch {
        self
    }

    pub fn begin(&self) -> DbResult<Arc<Transaction>> {
        self.pool.begin(false, self.log.end_of_log())
    }

    pub fn begin_serializable(&self) -> DbResult<Arc<Transaction>> {
        self.pool.begin(true, self.log.end_of_log())
    }

    pub fn commit(&self, tx: &Arc<Transaction>) -> DbResult<()> {
        let res = self.txlog.commit(tx);
        self.detector.finished(tx.id);
        res
    }

    pub fn rollback(&self, tx: &Arc<Transaction>) -> DbResult<()> {
        let res = self.txlog.abort(tx, self.as_dispatch());
        self.detector.finished(tx.id);
        res
    }

    fn assemble(opts: Options) -> DbResult<(Core, bool)> {
        std::fs::create_dir_all(&opts.dir)?;
        let (syskey, fresh) = SystemKey::open(&opts.dir.join("sys.key"))?;
        let syskey = Arc::new(syskey);
        let sys = syskey.snapshot();

        let files = Arc::new(FileSet::new());
        let sysdb = Arc::new(DbFile::open_or_create(&opts.dir.join("sys.db"), SYS_FILE_ID)?);
        if fresh {
            sysdb.extend_to(opts.initial_file_pages)?;
            bootstrap_sys_file(&sysdb, opts.initial_file_pages)?;
        }
        files.register(sysdb);

        let log = Arc::new(LogManager::open(
            &opts.dir,
            opts.redo_capacity,
            sys.undo_base,
        )?);
        let buffers = Arc::new(BufferPool::new(
            opts.buffer_frames,
            files.clone(),
            log.clone(),
        ));
        let pool = Arc::new(TxPool::new(sys.next_tx_id));
        buffers.attach_tx_pool(pool.clone());
        let detector = Arc::new(DeadlockDetector::new(pool.clone()));
        let txlog = Arc::new(TxLogger::new(log.clone(), pool.clone()));
        let ckpt = CheckpointWriter::new(
            log.clone(),
            buffers.clone(),
            pool.clone(),
            syskey.clone(),
            files.clone(),
            opts.checkpoint_interval,
        );
        txlog.attach_checkpoint(ckpt.clone());

        let factory = Arc::new(SegmentFactory::new());
        factory.register(Arc::new(SpaceMethod));
        factory.register(Arc::new(CatalogMethod));
        factory.register(Arc::new(DatasetMethod));
        factory.register(Arc::new(TreeMethod));
        let registry = factory.registry();
        if fresh || sys.registry != registry {
            syskey.update(|d| {
                d.registry = registry;
                if fresh {
                    d.file_pages = vec![(SYS_FILE_ID, opts.initial_file_pages)];
                }
            })?;
        }

        let space = Arc::new(SpaceManager::new());
        Ok((
            Core {
                opts,
                files,
                log,
                buffers,
                pool,
                detector,
                txlog,
                factory,
                space,
                ckpt,
                syskey,
            },
            fresh,
        ))
    }
}

/// Format the fixed pages of a fresh sys.db directly: reserved page 0, the
/// two extent tables, the segment catalog, and one free extent covering
/// the rest of the file. Recovery of an empty log sees a consistent image.
fn bootstrap_sys_file(file: &DbFile, total_pages: u32) -> DbResult<()> {
    let entry_body = PAGE_HEADER_SIZE;
    for p in FREE_EXTENTS_PAGE..FREE_EXTENTS_PAGE + EXTENT_TABLE_PAGES {
        let mut page = Page::new();
        page.set_segment_type(SEG_SPACE);
        page.set_page_type(page_type::EXTENTS);
        if p == FREE_EXTENTS_PAGE {
            page.write_u16(entry_body, 1);
            let start = FilePage::new(SYS_FILE_ID, SYS_FIRST_FREE_PAGE);
            page.write_u64(entry_body + 2, start.to_raw());
            page.write_u32(entry_body + 10, total_pages - SYS_FIRST_FREE_PAGE);
            page.write_u64(entry_body + 14, NONE_RAW);
        }
        file.write_page(p, &page)?;
    }
    for p in USED_EXTENTS_PAGE..USED_EXTENTS_PAGE + EXTENT_TABLE_PAGES {
        let mut page = Page::new();
        page.set_segment_type(SEG_SPACE);
        page.set_page_type(page_type::EXTENTS);
        file.write_page(p, &page)?;
    }
    let mut page = Page::new();
    page.set_segment_type(SEG_CATALOG);
    page.set_page_type(page_type::CATALOG);
    file.write_page(SEGMENT_CATALOG_PAGE, &page)?;
    file.sync()?;
    info!(total_pages, "sys.db formatted");
    Ok(())
}

/// An open database: the core plus its background threads. Dropping it is
/// a simulated crash (threads stop, nothing more is flushed); `stop`
/// quiesces, checkpoints and shuts down cleanly.
pub struct Db {
    core: Arc<Core>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Deref for Db {
    type Target = Core;
    fn deref(&self) -> &Core {
        &self.core
    }
}

impl Db {
    /// open_or_create, recover, serve.
    pub fn open(opts: Options) -> DbResult<Db> {
        let (core, _fresh) = Core::assemble(opts)?;
        let core = Arc::new(core);
        RecoveryManager::recover(&core)?;
        {
            // restart repair: pages added by a crashed file extension
            let tx = core.begin()?;
            core.space.recover_file_tails(&core, &tx)?;
            core.txlog.commit(&tx)?;
        }
        core.ckpt.sync_checkpoint()?;
        let threads = vec![core.ckpt.spawn(), core.space.extender.spawn(core.clone())];
        info!(dir = %core.opts.dir.display(), "database open");
        Ok(Db {
            core,
            threads: Mutex::new(threads),
        })
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn checkpoint(&self) -> DbResult<()> {
        self.core.ckpt.sync_checkpoint()
    }

    /// Clean shutdown: drain transactions, final checkpoint, stop threads.
    pub fn stop(self) -> DbResult<()> {
        if !self.core.pool.quiesce(Duration::from_secs(30)) {
            return Err(DbError::Database(
                "transactions did not drain before shutdown".to_string(),
            ));
        }
        self.core.ckpt.sync_checkpoint()?;
        Ok(())
        // Drop joins the threads
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.core.ckpt.shutdown();
        self.core.space.extender.shutdown();
        for t in self.threads.lock().unwrap().drain(..) {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{BTree, Predicate};
    use crate::dataset::Dataset;
    use crate::storage::Rowid;
    use std::thread;
    use tempfile::tempdir;

    fn opts(dir: &std::path::Path) -> Options {
        let mut o = Options::new(dir);
        o.initial_file_pages = 512;
        o
    }

    fn key(i: usize) -> Vec<u8> {
        format!("key-{:05}-{}", i, "x".repeat(48)).into_bytes()
    }

    #[test]
    fn test_dataset_insert_fetch_remove() {
        let dir = tempdir().unwrap();
        let db = Db::open(opts(dir.path())).unwrap();
        let tx = db.begin().unwrap();
        let ds = Dataset::create(&db, &tx).unwrap();
        let rid = ds.insert(&db, &tx, b"hello").unwrap();
        db.commit(&tx).unwrap();

        let tx = db.begin().unwrap();
        assert_eq!(ds.fetch(&db, &tx, rid).unwrap(), Some(b"hello".to_vec()));
        assert!(ds.remove(&db, &tx, rid).unwrap());
        db.commit(&tx).unwrap();

        let tx = db.begin().unwrap();
        assert_eq!(ds.fetch(&db, &tx, rid).unwrap(), None);
        assert!(!ds.remove(&db, &tx, rid).unwrap());
        db.commit(&tx).unwrap();
    }

    #[test]
    fn test_uncommitted_rows_are_invisible() {
        let dir = tempdir().unwrap();
        let db = Db::open(opts(dir.path())).unwrap();
        let setup = db.begin().unwrap();
        let ds = Dataset::create(&db, &setup).unwrap();
        db.commit(&setup).unwrap();

        let t1 = db.begin().unwrap();
        let rid = ds.insert(&db, &t1, b"secret").unwrap();
        // t1's insert is hidden from a concurrent snapshot
        let t2 = db.begin().unwrap();
        assert_eq!(ds.fetch(&db, &t2, rid).unwrap(), None);
        db.commit(&t1).unwrap();
        // still hidden from t2's old snapshot, visible to a fresh one
        assert_eq!(ds.fetch(&db, &t2, rid).unwrap(), None);
        db.commit(&t2).unwrap();
        let t3 = db.begin().unwrap();
        assert_eq!(ds.fetch(&db, &t3, rid).unwrap(), Some(b"secret".to_vec()));
        db.commit(&t3).unwrap();
    }

    #[test]
    fn test_rollback_undoes_insert_and_update() {
        let dir = tempdir().unwrap();
        let db = Db::open(opts(dir.path())).unwrap();
        let setup = db.begin().unwrap();
        let ds = Dataset::create(&db, &setup).unwrap();
        let rid = ds.insert(&db, &setup, b"v1").unwrap();
        db.commit(&setup).unwrap();

        let t1 = db.begin().unwrap();
        ds.update(&db, &t1, rid, b"v2").unwrap();
        let extra = ds.insert(&db, &t1, b"extra").unwrap();
        db.rollback(&t1).unwrap();

        let t2 = db.begin().unwrap();
        assert_eq!(ds.fetch(&db, &t2, rid).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(ds.fetch(&db, &t2, extra).unwrap(), None);
        db.commit(&t2).unwrap();
    }

    #[test]
    fn test_crash_before_commit_rolls_back() {
        let dir = tempdir().unwrap();
        let ds_id;
        let rids: Vec<Rowid>;
        let t1_id;
        {
            let db = Db::open(opts(dir.path())).unwrap();
            let setup = db.begin().unwrap();
            let ds = Dataset::create(&db, &setup).unwrap();
            ds_id = ds.segment_id;
            db.commit(&setup).unwrap();

            let t1 = db.begin().unwrap();
            t1_id = t1.id;
            rids = vec![
                ds.insert(&db, &t1, b"a").unwrap(),
                ds.insert(&db, &t1, b"b").unwrap(),
            ];
            // the checkpoint makes t1's updates durable while it is live
            db.checkpoint().unwrap();
            // crash without committing
        }
        let db = Db::open(opts(dir.path())).unwrap();
        let ds = Dataset::open(ds_id);
        let tx = db.begin().unwrap();
        assert!(tx.id > t1_id, "transaction ids never reuse");
        for rid in rids {
            assert_eq!(ds.fetch(&db, &tx, rid).unwrap(), None);
        }
        db.commit(&tx).unwrap();
    }

    #[test]
    fn test_commit_then_crash_survives() {
        let dir = tempdir().unwrap();
        let ds_id;
        let rid;
        {
            let db = Db::open(opts(dir.path())).unwrap();
            let tx = db.begin().unwrap();
            let ds = Dataset::create(&db, &tx).unwrap();
            ds_id = ds.segment_id;
            rid = ds.insert(&db, &tx, b"survivor").unwrap();
            db.commit(&tx).unwrap();
            // crash before any checkpoint sees the commit
        }
        let db = Db::open(opts(dir.path())).unwrap();
        let ds = Dataset::open(ds_id);
        let tx = db.begin().unwrap();
        assert_eq!(ds.fetch(&db, &tx, rid).unwrap(), Some(b"survivor".to_vec()));
        db.commit(&tx).unwrap();
    }

    #[test]
    fn test_recovery_twice_is_noop() {
        let dir = tempdir().unwrap();
        let ds_id;
        let rid;
        {
            let db = Db::open(opts(dir.path())).unwrap();
            let tx = db.begin().unwrap();
            let ds = Dataset::create(&db, &tx).unwrap();
            ds_id = ds.segment_id;
            rid = ds.insert(&db, &tx, b"stable").unwrap();
            db.commit(&tx).unwrap();
        }
        for _ in 0..2 {
            let db = Db::open(opts(dir.path())).unwrap();
            let ds = Dataset::open(ds_id);
            let tx = db.begin().unwrap();
            assert_eq!(ds.fetch(&db, &tx, rid).unwrap(), Some(b"stable".to_vec()));
            db.commit(&tx).unwrap();
        }
    }

    #[test]
    fn test_serializable_conflict() {
        let dir = tempdir().unwrap();
        let db = Db::open(opts(dir.path())).unwrap();
        let setup = db.begin().unwrap();
        let ds = Dataset::create(&db, &setup).unwrap();
        let rid = ds.insert(&db, &setup, b"ten").unwrap();
        db.commit(&setup).unwrap();

        let t2 = db.begin_serializable().unwrap();
        let t1 = db.begin().unwrap();
        ds.update(&db, &t1, rid, b"eleven").unwrap();
        db.commit(&t1).unwrap();
        // t1 committed after t2's snapshot: write skew would be invisible
        let err = ds.update(&db, &t2, rid, b"twelve").unwrap_err();
        assert!(matches!(err, DbError::SerializationConflict));
        db.rollback(&t2).unwrap();
    }

    #[test]
    fn test_deadlock_one_victim_one_survivor() {
        let dir = tempdir().unwrap();
        let db = Arc::new(Db::open(opts(dir.path())).unwrap());
        let setup = db.begin().unwrap();
        let ds = Dataset::create(&db, &setup).unwrap();
        let row_a = ds.insert(&db, &setup, b"a").unwrap();
        let row_b = ds.insert(&db, &setup, b"b").unwrap();
        db.commit(&setup).unwrap();

        let t1 = db.begin().unwrap();
        let t2 = db.begin().unwrap();
        ds.fetch_for_update(&db, &t1, row_a).unwrap();
        ds.fetch_for_update(&db, &t2, row_b).unwrap();

        let mut handles = Vec::new();
        for (tx, target) in [(t1.clone(), row_b), (t2.clone(), row_a)] {
            let db = db.clone();
            handles.push(thread::spawn(move || {
                match ds.fetch_for_update(&db, &tx, target) {
                    Ok(_) => {
                        db.commit(&tx).unwrap();
                        true
                    }
                    Err(DbError::TransactionCancelled) => {
                        db.rollback(&tx).unwrap();
                        false
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }));
        }
        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            results.iter().filter(|ok| **ok).count(),
            1,
            "exactly one transaction survives the deadlock"
        );
    }

    #[test]
    fn test_btree_unique_and_ordered_scan() {
        let dir = tempdir().unwrap();
        let db = Db::open(opts(dir.path())).unwrap();
        let tx = db.begin().unwrap();
        let tree = BTree::create(&db, &tx).unwrap();
        for i in (0..300).rev() {
            tree.insert(&db, &tx, &key(i), Rowid::new(FilePage::new(0, 1), i as i16))
                .unwrap();
        }
        let err = tree
            .insert(&db, &tx, &key(7), Rowid::new(FilePage::new(0, 1), 7))
            .unwrap_err();
        assert!(matches!(err, DbError::UniqueConstraint));
        db.commit(&tx).unwrap();
        assert!(tree.height(&db).unwrap() >= 1, "300 keys must have split");

        let tx = db.begin().unwrap();
        let (mut cursor, first) = tree
            .find_first(&db, &tx, &Predicate::All, false, None)
            .unwrap();
        let mut seen = vec![first.unwrap().0];
        while let Some((k, _)) = tree
            .find_next(&db, &tx, &mut cursor, &Predicate::All, None)
            .unwrap()
        {
            seen.push(k);
        }
        assert_eq!(seen.len(), 300);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted, "forward scan yields sorted keys");
        db.commit(&tx).unwrap();
    }

    #[test]
    fn test_btree_reverse_and_range_scans() {
        let dir = tempdir().unwrap();
        let db = Db::open(opts(dir.path())).unwrap();
        let tx = db.begin().unwrap();
        let tree = BTree::create(&db, &tx).unwrap();
        for i in 0..100 {
            tree.insert(&db, &tx, &key(i), Rowid::new(FilePage::new(0, 1), i as i16))
                .unwrap();
        }
        db.commit(&tx).unwrap();

        let tx = db.begin().unwrap();
        let pred = Predicate::Range {
            lo: Some(key(10)),
            lo_incl: true,
            hi: Some(key(20)),
            hi_incl: false,
        };
        let (mut cursor, first) = tree.find_first(&db, &tx, &pred, false, None).unwrap();
        let mut n = usize::from(first.is_some());
        while tree
            .find_next(&db, &tx, &mut cursor, &pred, None)
            .unwrap()
            .is_some()
        {
            n += 1;
        }
        assert_eq!(n, 10);

        let (mut cursor, first) = tree
            .find_first(&db, &tx, &Predicate::All, true, None)
            .unwrap();
        let mut rev = vec![first.unwrap().0];
        while let Some((k, _)) = tree
            .find_next(&db, &tx, &mut cursor, &Predicate::All, None)
            .unwrap()
        {
            rev.push(k);
        }
        assert_eq!(rev.len(), 100);
        assert!(rev.windows(2).all(|w| w[0] > w[1]), "reverse scan descends");
        db.commit(&tx).unwrap();
    }

    #[test]
    fn test_btree_rollback_across_splits() {
        let dir = tempdir().unwrap();
        let db = Db::open(opts(dir.path())).unwrap();
        let setup = db.begin().unwrap();
        let tree = BTree::create(&db, &setup).unwrap();
        db.commit(&setup).unwrap();

        let t1 = db.begin().unwrap();
        for i in 0..300 {
            tree.insert(&db, &t1, &key(i), Rowid::new(FilePage::new(0, 1), i as i16))
                .unwrap();
        }
        assert!(tree.height(&db).unwrap() >= 1);
        db.rollback(&t1).unwrap();

        // structural rearrangement survives, the entries do not
        let t2 = db.begin().unwrap();
        let (_, first) = tree
            .find_first(&db, &t2, &Predicate::All, false, None)
            .unwrap();
        assert!(first.is_none(), "rolled-back inserts must be invisible");
        // the keys are insertable again
        tree.insert(&db, &t2, &key(5), Rowid::new(FilePage::new(0, 1), 5))
            .unwrap();
        assert!(tree.lookup(&db, &t2, &key(5)).unwrap().is_some());
        db.commit(&t2).unwrap();
    }

    #[test]
    fn test_btree_balanced_ops_restore_shape() {
        let dir = tempdir().unwrap();
        let db = Db::open(opts(dir.path())).unwrap();
        let setup = db.begin().unwrap();
        let tree = BTree::create(&db, &setup).unwrap();
        db.commit(&setup).unwrap();
        assert_eq!(tree.height(&db).unwrap(), 0);
        let initial_pages = tree.page_count(&db).unwrap();

        let t1 = db.begin().unwrap();
        for i in 0..240 {
            tree.insert(&db, &t1, &key(i), Rowid::new(FilePage::new(0, 1), i as i16))
                .unwrap();
        }
        db.commit(&t1).unwrap();
        assert!(tree.height(&db).unwrap() >= 1);

        let t2 = db.begin().unwrap();
        for i in 0..240 {
            assert!(tree.remove(&db, &t2, &key(i)).unwrap());
        }
        db.commit(&t2).unwrap();

        let t3 = db.begin().unwrap();
        tree.vacuum(&db, &t3).unwrap();
        db.commit(&t3).unwrap();
        assert_eq!(tree.height(&db).unwrap(), 0);
        assert_eq!(tree.page_count(&db).unwrap(), initial_pages);
    }

    #[test]
    fn test_insert_over_deleted_key() {
        let dir = tempdir().unwrap();
        let db = Db::open(opts(dir.path())).unwrap();
        let tx = db.begin().unwrap();
        let tree = BTree::create(&db, &tx).unwrap();
        tree.insert(&db, &tx, b"dup", Rowid::new(FilePage::new(0, 1), 1))
            .unwrap();
        assert!(tree.remove(&db, &tx, b"dup").unwrap());
        db.commit(&tx).unwrap();

        // the deleter is universally committed: the reuse carries no
        // replaced-version baggage
        let tx = db.begin().unwrap();
        tree.insert(&db, &tx, b"dup", Rowid::new(FilePage::new(0, 1), 2))
            .unwrap();
        let rid = tree.lookup(&db, &tx, b"dup").unwrap().unwrap();
        assert_eq!(rid.index, 2);
        db.commit(&tx).unwrap();
    }

    #[test]
    fn test_checkpoint_crash_cycles() {
        let dir = tempdir().unwrap();
        let mut all: Vec<(Rowid, Vec<u8>)> = Vec::new();
        let ds_id;
        {
            let db = Db::open(opts(dir.path())).unwrap();
            let tx = db.begin().unwrap();
            ds_id = Dataset::create(&db, &tx).unwrap().segment_id;
            db.commit(&tx).unwrap();
        }
        for round in 0..3 {
            let db = Db::open(opts(dir.path())).unwrap();
            let ds = Dataset::open(ds_id);
            let tx = db.begin().unwrap();
            for i in 0..50 {
                let payload = format!("row-{}-{}", round, i).into_bytes();
                let rid = ds.insert(&db, &tx, &payload).unwrap();
                all.push((rid, payload));
            }
            db.commit(&tx).unwrap();
            db.checkpoint().unwrap();
            // crash by dropping
        }
        let db = Db::open(opts(dir.path())).unwrap();
        let ds = Dataset::open(ds_id);
        let tx = db.begin().unwrap();
        for (rid, payload) in &all {
            assert_eq!(ds.fetch(&db, &tx, *rid).unwrap().as_ref(), Some(payload));
        }
        db.commit(&tx).unwrap();
    }

    #[test]
    fn test_btree_crash_recovers_committed_inserts() {
        let dir = tempdir().unwrap();
        let tree_id;
        {
            let db = Db::open(opts(dir.path())).unwrap();
            let tx = db.begin().unwrap();
            let tree = BTree::create(&db, &tx).unwrap();
            tree_id = tree.segment_id;
            for i in 0..150 {
                tree.insert(&db, &tx, &key(i), Rowid::new(FilePage::new(0, 1), i as i16))
                    .unwrap();
            }
            db.commit(&tx).unwrap();
        }
        let db = Db::open(opts(dir.path())).unwrap();
        let tree = BTree::open(tree_id);
        let tx = db.begin().unwrap();
        for i in 0..150 {
            assert!(
                tree.lookup(&db, &tx, &key(i)).unwrap().is_some(),
                "key {} lost across restart",
                i
            );
        }
        db.commit(&tx).unwrap();
    }

    #[test]
    fn test_clean_stop_and_reopen() {
        let dir = tempdir().unwrap();
        let ds_id;
        let rid;
        {
            let db = Db::open(opts(dir.path())).unwrap();
            let tx = db.begin().unwrap();
            let ds = Dataset::create(&db, &tx).unwrap();
            ds_id = ds.segment_id;
            rid = ds.insert(&db, &tx, b"shutdown").unwrap();
            db.commit(&tx).unwrap();
            db.stop().unwrap();
        }
        let db = Db::open(opts(dir.path())).unwrap();
        let tx = db.begin().unwrap();
        assert_eq!(
            Dataset::open(ds_id).fetch(&db, &tx, rid).unwrap(),
            Some(b"shutdown".to_vec())
        );
        db.commit(&tx).unwrap();
    }
}
