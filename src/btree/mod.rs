use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::buffer::{Affinity, LatchMode, PinnedPage};
use crate::common::{DbError, DbResult};
use crate::core::Core;
use crate::dataset::check_row_lock;
use crate::log::record::tag;
use crate::log::{LogRecord, Lsn, RecordKind, NULL_LSN};
use crate::segment::{self, Segment, SegmentMethod, SEG_TREE};
use crate::storage::{FilePage, Page, Rowid};
use crate::tx::pool::Transaction;

pub mod node;
pub use node::{flags, BranchEntry, LeafEntry, TreeNode, LEAF_ENTRY_OVERHEAD};

use node::BRANCH_ENTRY_OVERHEAD;

/// Tree record sub-operations, carried in the OP chunk. Leaf undos are
/// logical: they carry the key, never a page.
pub mod op {
    pub const INSERT: u8 = 1;
    pub const REMOVE: u8 = 2;
    /// CLR payload: the entry state after an undo was applied.
    pub const SET: u8 = 3;
}

/// Per-segment key ordering, unifying `compare` behind one callback.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Byte-lexicographic order, the default.
pub struct LexicalComparator;

impl KeyComparator for LexicalComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Search predicates evaluated through the GiST `consistent` check.
#[derive(Clone, Debug)]
pub enum Predicate {
    All,
    Eq(Vec<u8>),
    Range {
        lo: Option<Vec<u8>>,
        lo_incl: bool,
        hi: Option<Vec<u8>>,
        hi_incl: bool,
    },
}

/// Optional entry filter consulted after the predicate.
pub trait EntryFilter {
    fn passes(&self, key: &[u8], rowid: Rowid) -> bool;
}

/// A prefix B-tree expressed through GiST primitives. Every node stores its
/// bounding predicate in slot 0; leaves hold MVCC-capable entries with
/// embedded row-header flags, lock holders and undo chains. Structural
/// modifications run as nested top actions; leaf undos are logical.
#[derive(Clone)]
pub struct BTree {
    pub segment_id: FilePage,
    cmp: Arc<dyn KeyComparator>,
}

/// Scan state: position plus the snapshot LSNs that make reads repeatable.
#[derive(Clone)]
pub struct Cursor {
    leaf: FilePage,
    index: usize,
    lsn_snapshot: Lsn,
    cusp: Lsn,
    last_key: Vec<u8>,
    reverse: bool,
}

const JUMPED: usize = usize::MAX;

impl BTree {
    pub fn create(core: &Core, tx: &Arc<Transaction>) -> DbResult<Self> {
        let seg = segment::create_segment(core, tx, SEG_TREE)?;
        Ok(BTree {
            segment_id: seg.segment_id,
            cmp: Arc::new(LexicalComparator),
        })
    }

    pub fn open(segment_id: FilePage) -> Self {
        BTree {
            segment_id,
            cmp: Arc::new(LexicalComparator),
        }
    }

    pub fn with_comparator(segment_id: FilePage, cmp: Arc<dyn KeyComparator>) -> Self {
        BTree { segment_id, cmp }
    }

    fn seg(&self, core: &Core) -> DbResult<Segment> {
        segment::catalog_lookup(core, self.segment_id)?
            .ok_or_else(|| DbError::Storage(format!("tree {} not found", self.segment_id)))
    }

    fn root(&self, core: &Core) -> DbResult<FilePage> {
        self.seg(core)?
            .data_root
            .ok_or_else(|| DbError::Storage("tree has no root".to_string()))
    }

    /// Levels above the leaves; an empty tree has height 0.
    pub fn height(&self, core: &Core) -> DbResult<u16> {
        let root = self.root(core)?;
        let pinned = core.buffers.pin(root, LatchMode::Shared)?;
        let level = TreeNode::level(&pinned.page());
        core.buffers.unpin(pinned, Affinity::Loved);
        Ok(level)
    }

    pub fn page_count(&self, core: &Core) -> DbResult<u32> {
        Ok(self.seg(core)?.page_count)
    }

    /// GiST consistency: may an entry with this key satisfy the predicate?
    pub fn consistent(&self, key: &[u8], pred: &Predicate) -> bool {
        match pred {
            Predicate::All => true,
            Predicate::Eq(k) => self.cmp.compare(key, k) == Ordering::Equal,
            Predicate::Range {
                lo,
                lo_incl,
                hi,
                hi_incl,
            } => {
                if let Some(lo) = lo {
                    match self.cmp.compare(key, lo) {
                        Ordering::Less => return false,
                        Ordering::Equal if !lo_incl => return false,
                        _ => {}
                    }
                }
                if let Some(hi) = hi {
                    match self.cmp.compare(key, hi) {
                        Ordering::Greater => return false,
                        Ordering::Equal if !hi_incl => return false,
                        _ => {}
                    }
                }
                true
            }
        }
    }

    /// No later entry can match, in the scan's direction.
    fn past_predicate(&self, key: &[u8], pred: &Predicate, reverse: bool) -> bool {
        match pred {
            Predicate::All => false,
            Predicate::Eq(k) => {
                let ord = self.cmp.compare(key, k);
                if reverse {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                }
            }
            Predicate::Range {
                lo,
                lo_incl,
                hi,
                hi_incl,
            } => {
                if reverse {
                    match lo {
                        Some(lo) => match self.cmp.compare(key, lo) {
                            Ordering::Less => true,
                            Ordering::Equal => !lo_incl,
                            Ordering::Greater => false,
                        },
                        None => false,
                    }
                } else {
                    match hi {
                        Some(hi) => match self.cmp.compare(key, hi) {
                            Ordering::Greater => true,
                            Ordering::Equal => !hi_incl,
                            Ordering::Less => false,
                        },
                        None => false,
                    }
                }
            }
        }
    }

    /// Binary search over entry slots [1, count). A key below the first
    /// entry yields insertion index 1; above the last, the slot count.
    fn search_node(&self, page: &Page, key: &[u8]) -> DbResult<Result<usize, usize>> {
        let n = TreeNode::dir().count(page);
        let mut lo = 1usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_key = TreeNode::entry_key(page, mid)?;
            match self.cmp.compare(&mid_key, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Branch descent: the child whose separator range contains `key`.
    /// With no exact match the predecessor entry is used.
    fn child_index(&self, page: &Page, key: Option<&[u8]>, rightmost: bool) -> DbResult<usize> {
        let n = TreeNode::dir().count(page);
        debug_assert!(n > 1, "branch without entries");
        if rightmost {
            return Ok(n - 1);
        }
        let Some(key) = key else { return Ok(1) };
        Ok(match self.search_node(page, key)? {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1).max(1),
        })
    }

    /// Read-only descent to the leaf that may contain `key` (or the
    /// leftmost/rightmost leaf).
    fn descend_read(
        &self,
        core: &Core,
        key: Option<&[u8]>,
        rightmost: bool,
    ) -> DbResult<PinnedPage> {
        let mut cur = self.root(core)?;
        loop {
            let pinned = core.buffers.pin(cur, LatchMode::Shared)?;
            let next = {
                let page = pinned.page();
                if TreeNode::is_leaf(&page) {
                    None
                } else {
                    let idx = self.child_index(&page, key, rightmost)?;
                    Some(TreeNode::branch_entry(&page, idx)?.child)
                }
            };
            match next {
                None => return Ok(pinned),
                Some(child) => {
                    core.buffers.unpin(pinned, Affinity::Loved);
                    cur = child;
                }
            }
        }
    }

    fn entry_need(page: &Page, key_len: usize) -> usize {
        if TreeNode::is_leaf(page) {
            LEAF_ENTRY_OVERHEAD + key_len + 2
        } else {
            BRANCH_ENTRY_OVERHEAD + key_len + 2
        }
    }

    /// Write descent with preemptive splitting: any full node on the path
    /// is split while its parent is still latched, so separator inserts
    /// never need a re-ascent.
    fn descend_write(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        key: &[u8],
    ) -> DbResult<PinnedPage> {
        'restart: loop {
            tx.check_cancelled()?;
            let root_id = self.root(core)?;
            let mut parent = core.buffers.pin(root_id, LatchMode::Exclusive)?;
            {
                let page = parent.page();
                let full = !TreeNode::dir().fits(&page, Self::entry_need(&page, key.len()));
                if full && TreeNode::entry_count(&page) >= 2 {
                    drop(page);
                    core.buffers.unpin(parent, Affinity::Liked);
                    self.split_root(core, tx)?;
                    continue 'restart;
                }
            }
            loop {
                let child_id = {
                    let page = parent.page();
                    if TreeNode::is_leaf(&page) {
                        drop(page);
                        return Ok(parent);
                    }
                    let idx = self.child_index(&page, Some(key), false)?;
                    TreeNode::branch_entry(&page, idx)?.child
                };
                let child = core.buffers.pin(child_id, LatchMode::Exclusive)?;
                let needs_split = {
                    let page = child.page();
                    !TreeNode::dir().fits(&page, Self::entry_need(&page, key.len()))
                        && TreeNode::entry_count(&page) >= 2
                };
                if needs_split {
                    self.split_child(core, tx, &parent, &child)?;
                    core.buffers.unpin(child, Affinity::Liked);
                    continue; // re-pick the half that now covers the key
                }
                core.buffers.unpin(parent, Affinity::Liked);
                parent = child;
            }
        }
    }

    /// Insert a unique key. The entry is locked by `tx` until commit.
    pub fn insert(&self, core: &Core, tx: &Arc<Transaction>, key: &[u8], rowid: Rowid) -> DbResult<()> {
        loop {
            tx.check_cancelled()?;
            let leaf = self.descend_write(core, tx, key)?;
            let (slot, existing) = {
                let page = leaf.page();
                match self.search_node(&page, key)? {
                    Ok(i) => (i, Some(TreeNode::leaf_entry(&page, i)?)),
                    Err(i) => {
                        if !TreeNode::dir().fits(&page, LEAF_ENTRY_OVERHEAD + key.len() + 2) {
                            return Err(DbError::Storage(
                                "key too large for a tree page".to_string(),
                            ));
                        }
                        (i, None)
                    }
                }
            };
            match existing {
                None => {
                    let mut undo = LogRecord::new(RecordKind::Update);
                    let mut redo = LogRecord::new(RecordKind::Update);
                    self.stamp(&mut undo, None);
                    self.stamp(&mut redo, Some(leaf.id()));
                    for rec in [&mut undo, &mut redo] {
                        rec.push(tag::OP, vec![op::INSERT]);
                        rec.push(tag::KEY, key.to_vec());
                    }
                    undo.push(tag::ROWID, rowid.to_bytes().to_vec());
                    let entry = LeafEntry {
                        flags: flags::LOCKED,
                        holder: tx.id,
                        undo: NULL_LSN,
                        key: key.to_vec(),
                        rowid,
                    };
                    redo.push_u16(tag::SLOT, slot as u16);
                    redo.push(tag::ENTRY, entry.to_bytes());
                    redo.push(tag::REPLACE, vec![0]);
                    let lsn = core.txlog.write_undo_redo(tx, &leaf, undo, redo)?;
                    let ulsn = tx.undo_next();
                    {
                        let mut page = leaf.page_mut();
                        let mut e = entry;
                        e.undo = ulsn;
                        TreeNode::dir().insert_row_at(&mut page, slot, &e.to_bytes());
                    }
                    core.buffers.unpin_dirty(leaf, Affinity::Liked, lsn);
                    tx.note_lock(rowid);
                    trace!(tx = tx.id, "tree key inserted");
                    return Ok(());
                }
                Some(entry) => {
                    if entry.flags & flags::DELETED == 0 {
                        core.buffers.unpin(leaf, Affinity::Liked);
                        return Err(DbError::UniqueConstraint);
                    }
                    let prev = match check_row_lock(core, tx, entry.flags, entry.holder) {
                        Ok(prev) => prev,
                        Err(DbError::LockConflict { holder }) => {
                            core.buffers.unpin(leaf, Affinity::Liked);
                            core.detector.wait_for(tx, holder)?;
                            continue;
                        }
                        Err(e) => {
                            core.buffers.unpin(leaf, Affinity::Liked);
                            return Err(e);
                        }
                    };
                    let universal = entry.flags & flags::LOCKED == 0
                        || prev == tx.id
                        || core.pool.is_universally_committed(prev);
                    let mut undo = LogRecord::new(RecordKind::Update);
                    let mut redo = LogRecord::new(RecordKind::Update);
                    self.stamp(&mut undo, None);
                    self.stamp(&mut redo, Some(leaf.id()));
                    for rec in [&mut undo, &mut redo] {
                        rec.push(tag::OP, vec![op::INSERT]);
                        rec.push(tag::KEY, key.to_vec());
                    }
                    undo.push(tag::ROWID, rowid.to_bytes().to_vec());
                    let new_flags = if universal {
                        flags::LOCKED
                    } else {
                        // the prior version must stay reachable for readers
                        undo.push(tag::PREV_ENTRY, entry.to_bytes());
                        undo.push_u64(tag::HOLDER, prev);
                        flags::LOCKED | flags::REPLACE
                    };
                    let new_entry = LeafEntry {
                        flags: new_flags,
                        holder: tx.id,
                        undo: NULL_LSN,
                        key: key.to_vec(),
                        rowid,
                    };
                    redo.push_u16(tag::SLOT, slot as u16);
                    redo.push(tag::ENTRY, new_entry.to_bytes());
                    redo.push(tag::REPLACE, vec![1]);
                    let lsn = core.txlog.write_undo_redo(tx, &leaf, undo, redo)?;
                    let ulsn = tx.undo_next();
                    {
                        let mut page = leaf.page_mut();
                        let mut e = new_entry;
                        e.undo = ulsn;
                        TreeNode::dir().replace_row(&mut page, slot, &e.to_bytes());
                    }
                    core.buffers.unpin_dirty(leaf, Affinity::Liked, lsn);
                    tx.note_lock(rowid);
                    return Ok(());
                }
            }
        }
    }

    /// Logical removal: the entry is marked deleted and keeps carrying the
    /// remover's lock; space is reclaimed once nobody can roll it back.
    pub fn remove(&self, core: &Core, tx: &Arc<Transaction>, key: &[u8]) -> DbResult<bool> {
        loop {
            tx.check_cancelled()?;
            let leaf = self.descend_write(core, tx, key)?;
            let (slot, entry) = {
                let page = leaf.page();
                match self.search_node(&page, key)? {
                    Ok(i) => (i, TreeNode::leaf_entry(&page, i)?),
                    Err(_) => {
                        drop(page);
                        core.buffers.unpin(leaf, Affinity::Liked);
                        return Ok(false);
                    }
                }
            };
            if entry.flags & flags::DELETED != 0 {
                if entry.flags & flags::LOCKED != 0
                    && !tx.sees(entry.holder)
                    && !core.pool.master_committed(entry.holder)
                {
                    core.buffers.unpin(leaf, Affinity::Liked);
                    core.detector.wait_for(tx, entry.holder)?;
                    continue;
                }
                core.buffers.unpin(leaf, Affinity::Liked);
                return Ok(false);
            }
            let prev = match check_row_lock(core, tx, entry.flags, entry.holder) {
                Ok(prev) => prev,
                Err(DbError::LockConflict { holder }) => {
                    core.buffers.unpin(leaf, Affinity::Liked);
                    core.detector.wait_for(tx, holder)?;
                    continue;
                }
                Err(e) => {
                    core.buffers.unpin(leaf, Affinity::Liked);
                    return Err(e);
                }
            };
            let replace =
                prev != 0 && prev != tx.id && !core.pool.is_universally_committed(prev);
            let mut undo = LogRecord::new(RecordKind::Update);
            let mut redo = LogRecord::new(RecordKind::Update);
            self.stamp(&mut undo, None);
            self.stamp(&mut redo, Some(leaf.id()));
            for rec in [&mut undo, &mut redo] {
                rec.push(tag::OP, vec![op::REMOVE]);
                rec.push(tag::KEY, key.to_vec());
            }
            undo.push(tag::ENTRY, entry.to_bytes());
            undo.push_u64(tag::HOLDER, prev);
            redo.push_u16(tag::SLOT, slot as u16);
            redo.push(tag::REPLACE, vec![replace as u8]);
            let lsn = core.txlog.write_undo_redo(tx, &leaf, undo, redo)?;
            let ulsn = tx.undo_next();
            let rowid = entry.rowid;
            {
                let mut page = leaf.page_mut();
                let mut e = entry;
                e.flags = flags::DELETED | flags::LOCKED | if replace { flags::REPLACE } else { 0 };
                e.holder = tx.id;
                e.undo = ulsn;
                TreeNode::dir().replace_row(&mut page, slot, &e.to_bytes());
            }
            let leaf_id = leaf.id();
            core.buffers.unpin_dirty(leaf, Affinity::Liked, lsn);
            tx.note_lock(rowid);
            self.maybe_merge(core, tx, leaf_id)?;
            return Ok(true);
        }
    }

    /// Point lookup through the MVCC observability rules.
    pub fn lookup(&self, core: &Core, tx: &Arc<Transaction>, key: &[u8]) -> DbResult<Option<Rowid>> {
        let (_cursor, first) =
            self.find_first(core, tx, &Predicate::Eq(key.to_vec()), false, None)?;
        Ok(first.map(|(_, rid)| rid))
    }

    fn stamp(&self, rec: &mut LogRecord, page: Option<FilePage>) {
        rec.segment_id = self.segment_id.to_raw();
        rec.segment_type = SEG_TREE;
        if let Some(p) = page {
            rec.page = p.to_raw();
        }
    }

    // ---- structural modifications -------------------------------------

    fn log_structural(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        pinned: &PinnedPage,
        before: &Page,
    ) -> DbResult<()> {
        let pt = pinned.page().page_type();
        if let Some(lsn) = core.txlog.log_page_change(
            tx,
            pinned,
            before,
            self.segment_id.to_raw(),
            SEG_TREE,
            pt,
        )? {
            core.buffers.mark_dirty(pinned, lsn);
        }
        Ok(())
    }

    /// Raise the tree height: a fresh root pointing at the old one through
    /// a minimum-bound entry. Nested top action.
    fn split_root(&self, core: &Core, tx: &Arc<Transaction>) -> DbResult<()> {
        let nta = core.txlog.begin_nested(tx);
        let res = (|| {
            let mut seg = self.seg(core)?;
            let old_id = seg
                .data_root
                .ok_or_else(|| DbError::Storage("tree has no root".to_string()))?;
            let (pred, level) = {
                let old = core.buffers.pin(old_id, LatchMode::Shared)?;
                let page = old.page();
                let out = (TreeNode::predicate(&page).to_vec(), TreeNode::level(&page));
                drop(page);
                core.buffers.unpin(old, Affinity::Loved);
                out
            };
            let new_id = segment::allocate_page(core, tx, self.segment_id)?;
            let newp = core.buffers.pin_new(new_id)?;
            let before = newp.page().clone();
            {
                let mut page = newp.page_mut();
                TreeNode::init(&mut page, SEG_TREE, level + 1, &pred);
                let entry = BranchEntry {
                    key: pred.clone(),
                    child: old_id,
                };
                TreeNode::dir().push_row(&mut page, &entry.to_bytes());
            }
            self.log_structural(core, tx, &newp, &before)?;
            core.buffers.unpin(newp, Affinity::Liked);
            seg = self.seg(core)?;
            seg.data_root = Some(new_id);
            segment::catalog_put(core, tx, &seg)?;
            debug!(tree = %self.segment_id, new_root = %new_id, "root raised");
            Ok(())
        })();
        match res {
            Ok(()) => core.txlog.commit_nested(tx, nta),
            Err(e) => {
                core.txlog.rollback_nested(tx, nta, core)?;
                Err(e)
            }
        }
    }

    /// Split `child` while `parent` is exclusively latched: pick the
    /// separator, move the upper half into a fresh right sibling, stitch
    /// the sibling links on three pages, insert the separator into the
    /// parent. Nested top action.
    fn split_child(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        parent: &PinnedPage,
        child: &PinnedPage,
    ) -> DbResult<()> {
        let nta = core.txlog.begin_nested(tx);
        let res = (|| {
            let new_id = segment::allocate_page(core, tx, self.segment_id)?;
            let newp = core.buffers.pin_new(new_id)?;
            let before_new = newp.page().clone();
            let before_child = child.page().clone();
            // pick_split: middle separator; upper half moves right
            let (sep, level, moved, old_next) = {
                let page = child.page();
                let n = TreeNode::dir().count(&page);
                let mid = 1 + (n - 1) / 2;
                let sep = TreeNode::entry_key(&page, mid)?;
                let moved: Vec<Vec<u8>> = (mid..n)
                    .map(|i| TreeNode::dir().row(&page, i).to_vec())
                    .collect();
                (sep, TreeNode::level(&page), moved, TreeNode::next_page(&page))
            };
            {
                let mut page = newp.page_mut();
                TreeNode::init(&mut page, SEG_TREE, level, &sep);
                for row in &moved {
                    TreeNode::dir().push_row(&mut page, row);
                }
                TreeNode::set_prev_page(&mut page, Some(child.id()));
                TreeNode::set_next_page(&mut page, old_next);
            }
            self.log_structural(core, tx, &newp, &before_new)?;
            core.buffers.unpin(newp, Affinity::Liked);
            {
                let mut page = child.page_mut();
                for _ in 0..moved.len() {
                    let c = TreeNode::dir().count(&page);
                    TreeNode::dir().remove_row_at(&mut page, c - 1);
                }
                TreeNode::set_next_page(&mut page, Some(new_id));
            }
            self.log_structural(core, tx, child, &before_child)?;
            if let Some(next_id) = old_next {
                let next = core.buffers.pin(next_id, LatchMode::Exclusive)?;
                let before = next.page().clone();
                TreeNode::set_prev_page(&mut next.page_mut(), Some(child.id()));
                self.log_structural(core, tx, &next, &before)?;
                core.buffers.unpin(next, Affinity::Liked);
            }
            let before_parent = parent.page().clone();
            {
                let mut page = parent.page_mut();
                let idx = match self.search_node(&page, &sep)? {
                    Ok(i) => i,
                    Err(i) => i,
                };
                let entry = BranchEntry {
                    key: sep,
                    child: new_id,
                };
                TreeNode::dir().insert_row_at(&mut page, idx, &entry.to_bytes());
            }
            self.log_structural(core, tx, parent, &before_parent)?;
            debug!(tree = %self.segment_id, left = %child.id(), right = %new_id, "node split");
            Ok(())
        })();
        match res {
            Ok(()) => core.txlog.commit_nested(tx, nta),
            Err(e) => {
                core.txlog.rollback_nested(tx, nta, core)?;
                Err(e)
            }
        }
    }

    /// Merge a leaf whose entries are all deleted and past rollback reach:
    /// unstitch it, drop the parent separator, free the page. Cascades up
    /// empty branches and lowers the root when it has a single child.
    fn maybe_merge(&self, core: &Core, tx: &Arc<Transaction>, leaf_id: FilePage) -> DbResult<()> {
        let root = self.root(core)?;
        if leaf_id == root {
            return Ok(());
        }
        let empty = {
            let pinned = core.buffers.pin(leaf_id, LatchMode::Shared)?;
            let page = pinned.page();
            let n = TreeNode::dir().count(&page);
            let mut all_dead = true;
            for i in 1..n {
                let e = TreeNode::leaf_entry(&page, i)?;
                if e.flags & flags::DELETED == 0
                    || (e.flags & flags::LOCKED != 0
                        && !core.pool.is_universally_committed(e.holder))
                {
                    all_dead = false;
                    break;
                }
            }
            drop(page);
            core.buffers.unpin(pinned, Affinity::Loved);
            all_dead
        };
        if !empty {
            return Ok(());
        }
        self.merge_node(core, tx, leaf_id)
    }

    fn merge_node(&self, core: &Core, tx: &Arc<Transaction>, node_id: FilePage) -> DbResult<()> {
        let nta = core.txlog.begin_nested(tx);
        let res = (|| {
            let Some((parent_id, idx)) = self.find_parent(core, node_id)? else {
                return Ok(None);
            };
            let parent = core.buffers.pin(parent_id, LatchMode::Exclusive)?;
            // revalidate under the latch
            let idx = {
                let page = parent.page();
                let n = TreeNode::dir().count(&page);
                let mut found = None;
                for i in 1..n {
                    if TreeNode::branch_entry(&page, i)?.child == node_id {
                        found = Some(i);
                        break;
                    }
                }
                match found {
                    Some(i) => i,
                    None => {
                        drop(page);
                        core.buffers.unpin(parent, Affinity::Liked);
                        return Ok(None);
                    }
                }
            };
            // the last separator under the root is the lower-height case,
            // not a merge
            if parent_id == self.root(core)? && TreeNode::entry_count(&parent.page()) == 1 {
                core.buffers.unpin(parent, Affinity::Liked);
                return Ok(None);
            }
            // unstitch sibling links
            let (prev_id, next_id) = {
                let node = core.buffers.pin(node_id, LatchMode::Shared)?;
                let page = node.page();
                let out = (TreeNode::prev_page(&page), TreeNode::next_page(&page));
                drop(page);
                core.buffers.unpin(node, Affinity::Loved);
                out
            };
            if let Some(p) = prev_id {
                let pin = core.buffers.pin(p, LatchMode::Exclusive)?;
                let before = pin.page().clone();
                TreeNode::set_next_page(&mut pin.page_mut(), next_id);
                self.log_structural(core, tx, &pin, &before)?;
                core.buffers.unpin(pin, Affinity::Liked);
            }
            if let Some(n) = next_id {
                let pin = core.buffers.pin(n, LatchMode::Exclusive)?;
                let before = pin.page().clone();
                TreeNode::set_prev_page(&mut pin.page_mut(), prev_id);
                self.log_structural(core, tx, &pin, &before)?;
                core.buffers.unpin(pin, Affinity::Liked);
            }
            // drop the separator, adjusting the min key when the first
            // entry goes (safe: the bound only expands the covered range)
            let before_parent = parent.page().clone();
            let mut adjust: Option<(FilePage, Vec<u8>)> = None;
            {
                let mut page = parent.page_mut();
                TreeNode::dir().remove_row_at(&mut page, idx);
                if idx == 1 && TreeNode::entry_count(&page) > 0 {
                    let pred = TreeNode::predicate(&page).to_vec();
                    let first = TreeNode::branch_entry(&page, 1)?;
                    let rebuilt = BranchEntry {
                        key: pred.clone(),
                        child: first.child,
                    };
                    TreeNode::dir().replace_row(&mut page, 1, &rebuilt.to_bytes());
                    adjust = Some((first.child, pred));
                }
            }
            self.log_structural(core, tx, &parent, &before_parent)?;
            let remaining = TreeNode::entry_count(&parent.page());
            core.buffers.unpin(parent, Affinity::Liked);
            if let Some((child, pred)) = adjust {
                self.min_key_adjust(core, tx, child, &pred)?;
            }
            segment::free_page_push(core, tx, self.segment_id, node_id)?;
            Ok(Some((parent_id, remaining)))
        })();
        match res {
            Ok(outcome) => {
                core.txlog.commit_nested(tx, nta)?;
                if let Some((parent_id, remaining)) = outcome {
                    let root = self.root(core)?;
                    if remaining == 0 && parent_id != root {
                        self.merge_node(core, tx, parent_id)?;
                    } else if parent_id == root {
                        self.maybe_lower_root(core, tx)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                core.txlog.rollback_nested(tx, nta, core)?;
                Err(e)
            }
        }
    }

    /// Merge every leaf whose entries are all deleted and past rollback
    /// reach, then lower the root as far as it goes. A balanced
    /// insert/remove history brings the tree back to its initial shape.
    pub fn vacuum(&self, core: &Core, tx: &Arc<Transaction>) -> DbResult<()> {
        let mut leaves = Vec::new();
        {
            let mut pinned = self.descend_read(core, None, false)?;
            loop {
                leaves.push(pinned.id());
                let next = TreeNode::next_page(&pinned.page());
                core.buffers.unpin(pinned, Affinity::Loved);
                match next {
                    Some(n) => pinned = core.buffers.pin(n, LatchMode::Shared)?,
                    None => break,
                }
            }
        }
        for leaf in leaves {
            self.maybe_merge(core, tx, leaf)?;
        }
        self.maybe_lower_root(core, tx)
    }

    /// When the root branch is down to one child, that child becomes the
    /// root and the height drops.
    fn maybe_lower_root(&self, core: &Core, tx: &Arc<Transaction>) -> DbResult<()> {
        loop {
            let mut seg = self.seg(core)?;
            let root_id = seg
                .data_root
                .ok_or_else(|| DbError::Storage("tree has no root".to_string()))?;
            let only_child = {
                let pinned = core.buffers.pin(root_id, LatchMode::Shared)?;
                let page = pinned.page();
                let child = if !TreeNode::is_leaf(&page) && TreeNode::entry_count(&page) == 1 {
                    Some(TreeNode::branch_entry(&page, 1)?.child)
                } else {
                    None
                };
                drop(page);
                core.buffers.unpin(pinned, Affinity::Loved);
                child
            };
            let Some(child) = only_child else {
                return Ok(());
            };
            let nta = core.txlog.begin_nested(tx);
            let res = (|| {
                seg = self.seg(core)?;
                seg.data_root = Some(child);
                segment::catalog_put(core, tx, &seg)?;
                segment::free_page_push(core, tx, self.segment_id, root_id)
            })();
            match res {
                Ok(()) => {
                    core.txlog.commit_nested(tx, nta)?;
                    debug!(tree = %self.segment_id, new_root = %child, "root lowered");
                }
                Err(e) => {
                    core.txlog.rollback_nested(tx, nta, core)?;
                    return Err(e);
                }
            }
        }
    }

    /// Propagate an expanded minimum bound into a child's slot-0 predicate
    /// (and its first separator, recursively).
    fn min_key_adjust(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        node_id: FilePage,
        pred: &[u8],
    ) -> DbResult<()> {
        let pinned = core.buffers.pin(node_id, LatchMode::Exclusive)?;
        let before = pinned.page().clone();
        let mut descend: Option<FilePage> = None;
        {
            let mut page = pinned.page_mut();
            TreeNode::set_predicate(&mut page, pred);
            if !TreeNode::is_leaf(&page) && TreeNode::entry_count(&page) > 0 {
                let first = TreeNode::branch_entry(&page, 1)?;
                let rebuilt = BranchEntry {
                    key: pred.to_vec(),
                    child: first.child,
                };
                TreeNode::dir().replace_row(&mut page, 1, &rebuilt.to_bytes());
                descend = Some(first.child);
            }
        }
        self.log_structural(core, tx, &pinned, &before)?;
        core.buffers.unpin(pinned, Affinity::Liked);
        if let Some(child) = descend {
            self.min_key_adjust(core, tx, child, pred)?;
        }
        Ok(())
    }

    /// Locate the branch holding the separator for `node_id` by walking
    /// down toward the node's bounding predicate.
    fn find_parent(&self, core: &Core, node_id: FilePage) -> DbResult<Option<(FilePage, usize)>> {
        let pred = {
            let pinned = core.buffers.pin(node_id, LatchMode::Shared)?;
            let p = TreeNode::predicate(&pinned.page()).to_vec();
            core.buffers.unpin(pinned, Affinity::Loved);
            p
        };
        let mut cur = self.root(core)?;
        loop {
            if cur == node_id {
                return Ok(None);
            }
            let pinned = core.buffers.pin(cur, LatchMode::Shared)?;
            let step = {
                let page = pinned.page();
                if TreeNode::is_leaf(&page) {
                    None
                } else {
                    let n = TreeNode::dir().count(&page);
                    let mut hit = None;
                    for i in 1..n {
                        if TreeNode::branch_entry(&page, i)?.child == node_id {
                            hit = Some(i);
                            break;
                        }
                    }
                    match hit {
                        Some(i) => Some(Ok(i)),
                        None => {
                            let idx = self.child_index(&page, Some(&pred), false)?;
                            Some(Err(TreeNode::branch_entry(&page, idx)?.child))
                        }
                    }
                }
            };
            core.buffers.unpin(pinned, Affinity::Loved);
            match step {
                None => return Ok(None),
                Some(Ok(i)) => return Ok(Some((cur, i))),
                Some(Err(child)) => cur = child,
            }
        }
    }

    // ---- scans ---------------------------------------------------------

    /// Open a cursor: descend, position at the search index, and surface
    /// the first observable matching entry (falling through to the
    /// advancing path when the positioned entry does not qualify).
    pub fn find_first(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        pred: &Predicate,
        reverse: bool,
        filter: Option<&dyn EntryFilter>,
    ) -> DbResult<(Cursor, Option<(Vec<u8>, Rowid)>)> {
        let start_key: Option<Vec<u8>> = match pred {
            Predicate::All => None,
            Predicate::Eq(k) => Some(k.clone()),
            Predicate::Range { lo, hi, .. } => {
                if reverse {
                    hi.clone()
                } else {
                    lo.clone()
                }
            }
        };
        let rightmost = reverse && start_key.is_none();
        let leaf = self.descend_read(core, start_key.as_deref(), rightmost)?;
        let (index, lsn_snapshot) = {
            let page = leaf.page();
            let idx = match start_key.as_deref() {
                None => {
                    if reverse {
                        TreeNode::dir().count(&page).saturating_sub(1).max(1)
                    } else {
                        1
                    }
                }
                Some(k) => match self.search_node(&page, k)? {
                    Ok(i) => i,
                    Err(i) => {
                        if reverse {
                            i.saturating_sub(1).max(1)
                        } else {
                            i
                        }
                    }
                },
            };
            (idx, page.lsn())
        };
        let mut cursor = Cursor {
            leaf: leaf.id(),
            index,
            lsn_snapshot,
            cusp: core.log.stability_point(),
            last_key: start_key.unwrap_or_default(),
            reverse,
        };
        core.buffers.unpin(leaf, Affinity::Loved);
        let first = self.advance(core, tx, &mut cursor, pred, filter, true)?;
        Ok((cursor, first))
    }

    /// Advance the cursor to the next observable matching entry.
    pub fn find_next(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        cursor: &mut Cursor,
        pred: &Predicate,
        filter: Option<&dyn EntryFilter>,
    ) -> DbResult<Option<(Vec<u8>, Rowid)>> {
        self.advance(core, tx, cursor, pred, filter, false)
    }

    fn advance(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        cursor: &mut Cursor,
        pred: &Predicate,
        filter: Option<&dyn EntryFilter>,
        mut examine_current: bool,
    ) -> DbResult<Option<(Vec<u8>, Rowid)>> {
        loop {
            tx.check_cancelled()?;
            let pinned = core.buffers.pin(cursor.leaf, LatchMode::Shared)?;
            let mut jump: Option<Option<FilePage>> = None;
            let mut hit: Option<LeafEntry> = None;
            {
                let page = pinned.page();
                let count = TreeNode::dir().count(&page);
                if cursor.index == JUMPED {
                    cursor.index = count.saturating_sub(1).max(1);
                    cursor.lsn_snapshot = page.lsn();
                    examine_current = true;
                } else if page.lsn() != cursor.lsn_snapshot {
                    // the page changed under us; the last key may have
                    // migrated on a split, re-locate it
                    cursor.lsn_snapshot = page.lsn();
                    match self.search_node(&page, &cursor.last_key)? {
                        Ok(i) => {
                            cursor.index = i;
                            // the last returned key itself: step past it
                            examine_current = false;
                        }
                        Err(i) => {
                            cursor.index = if cursor.reverse {
                                i.saturating_sub(1).max(1)
                            } else {
                                i
                            };
                            examine_current = true;
                        }
                    }
                }
                if !examine_current {
                    if cursor.reverse {
                        if cursor.index <= 1 {
                            jump = Some(TreeNode::prev_page(&page));
                        } else {
                            cursor.index -= 1;
                        }
                    } else {
                        cursor.index += 1;
                    }
                }
                examine_current = false;
                if jump.is_none() {
                    if cursor.index >= count || cursor.index < 1 {
                        jump = Some(if cursor.reverse {
                            TreeNode::prev_page(&page)
                        } else {
                            TreeNode::next_page(&page)
                        });
                    } else {
                        hit = Some(TreeNode::leaf_entry(&page, cursor.index)?);
                    }
                }
            }
            core.buffers.unpin(pinned, Affinity::Loved);
            if let Some(sibling) = jump {
                match sibling {
                    None => return Ok(None),
                    Some(next) => {
                        cursor.leaf = next;
                        cursor.index = if cursor.reverse { JUMPED } else { 1 };
                        cursor.lsn_snapshot = NULL_LSN;
                        examine_current = !cursor.reverse;
                        // force a fresh snapshot read on the next loop
                        continue;
                    }
                }
            }
            let entry = hit.expect("either a jump or an entry");
            cursor.last_key = entry.key.clone();
            if self.past_predicate(&entry.key, pred, cursor.reverse) {
                return Ok(None);
            }
            if !self.consistent(&entry.key, pred) {
                continue;
            }
            if let Some(version) = self.resolve_version(core, tx, &entry, cursor.cusp, 0)? {
                if filter
                    .map(|f| f.passes(&version.0, version.1))
                    .unwrap_or(true)
                {
                    return Ok(Some(version));
                }
            }
        }
    }

    /// The observability rules for a leaf entry, recursing into prior
    /// versions through the entry's undo pointer.
    fn resolve_version(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        entry: &LeafEntry,
        cusp: Lsn,
        depth: usize,
    ) -> DbResult<Option<(Vec<u8>, Rowid)>> {
        if depth > 32 {
            return Err(DbError::Storage("version chain too deep".to_string()));
        }
        let live = || {
            if entry.flags & flags::DELETED == 0 {
                Some((entry.key.clone(), entry.rowid))
            } else {
                None
            }
        };
        if entry.flags & flags::LOCKED == 0 {
            return Ok(live());
        }
        if tx.sees(entry.holder) {
            // cursor stability: an effect newer than the open point is
            // treated like an invisible one
            let newer = entry.undo != NULL_LSN
                && entry.undo >= core.log.undo_base()
                && core.log.read_undo(entry.undo)?.pair_lsn > cusp;
            if !newer {
                return Ok(live());
            }
        }
        // need a prior version
        if entry.flags & flags::REPLACE == 0 {
            // the prior version was universally committed: it existed and
            // was live iff the current row is a deletion marker
            return Ok(if entry.flags & flags::DELETED != 0 {
                Some((entry.key.clone(), entry.rowid))
            } else {
                None
            });
        }
        if entry.undo == NULL_LSN || entry.undo < core.log.undo_base() {
            return Ok(None);
        }
        let rec = core.log.read_undo(entry.undo)?;
        let prior = rec
            .chunk(tag::PREV_ENTRY)
            .or_else(|| rec.chunk(tag::ENTRY));
        match prior {
            Some(bytes) => {
                let prev = LeafEntry::from_bytes(bytes)?;
                self.resolve_version(core, tx, &prev, cusp, depth + 1)
            }
            None => Ok(None),
        }
    }
}

/// The tree's segment method: physical redo for structural records, typed
/// redo for leaf records, logical (key-addressed) undo for leaf records.
pub struct TreeMethod;

impl TreeMethod {
    fn patch_undo(entry_bytes: &mut [u8], ulsn: Lsn) {
        entry_bytes[LeafEntry::UNDO_OFFSET..LeafEntry::UNDO_OFFSET + 8]
            .copy_from_slice(&ulsn.to_le_bytes());
    }

    /// Byte-equality key search, independent of any custom comparator.
    fn find_key(page: &Page, key: &[u8]) -> DbResult<Option<usize>> {
        let n = TreeNode::dir().count(page);
        for i in 1..n {
            if TreeNode::leaf_entry(page, i)?.key == key {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// The inverse of a leaf operation, applied to whatever page currently
    /// holds the key. Returns the restored entry bytes and its slot.
    fn apply_inverse(
        rec: &LogRecord,
        page: &mut Page,
        universal: impl Fn(u64) -> bool,
    ) -> DbResult<Option<(usize, Vec<u8>)>> {
        let key = rec.require(tag::KEY)?.to_vec();
        let Some(slot) = Self::find_key(page, &key)? else {
            return Ok(None);
        };
        let opcode = rec.require(tag::OP)?[0];
        let current = TreeNode::leaf_entry(page, slot)?;
        let restored = match opcode {
            op::INSERT => match rec.chunk(tag::PREV_ENTRY) {
                Some(prev_bytes) => {
                    let prev = LeafEntry::from_bytes(prev_bytes)?;
                    if !universal(prev.holder) {
                        // re-insert the prior entry, keeping its lock
                        prev.to_bytes()
                    } else {
                        let mut e = current;
                        e.flags = flags::DELETED;
                        e.undo = NULL_LSN;
                        e.to_bytes()
                    }
                }
                None => {
                    let mut e = current;
                    e.flags = flags::DELETED;
                    e.undo = NULL_LSN;
                    e.to_bytes()
                }
            },
            op::REMOVE => {
                let mut prev = LeafEntry::from_bytes(rec.require(tag::ENTRY)?)?;
                if prev.flags & flags::LOCKED != 0 && universal(prev.holder) {
                    prev.flags &= !flags::LOCKED;
                }
                prev.to_bytes()
            }
            other => {
                return Err(DbError::Rollback(format!("unknown tree op {}", other)));
            }
        };
        TreeNode::dir().replace_row(page, slot, &restored);
        Ok(Some((slot, restored)))
    }
}

impl SegmentMethod for TreeMethod {
    fn segment_type(&self) -> u8 {
        SEG_TREE
    }

    fn name(&self) -> &'static str {
        "tree"
    }

    fn create(&self, core: &Core, seg: &Segment, tx: &Arc<Transaction>) -> DbResult<()> {
        let page_id = segment::allocate_page(core, tx, seg.segment_id)?;
        let pinned = core.buffers.pin_new(page_id)?;
        let before = pinned.page().clone();
        TreeNode::init(&mut pinned.page_mut(), SEG_TREE, 0, b"");
        if let Some(lsn) = core.txlog.log_page_change(
            tx,
            &pinned,
            &before,
            seg.segment_id.to_raw(),
            SEG_TREE,
            crate::storage::page::page_type::TREE_LEAF,
        )? {
            core.buffers.unpin_dirty(pinned, Affinity::Liked, lsn);
        } else {
            core.buffers.unpin(pinned, Affinity::Liked);
        }
        let mut fresh = segment::catalog_lookup(core, seg.segment_id)?
            .ok_or_else(|| DbError::Storage("segment missing during create".to_string()))?;
        fresh.data_root = Some(page_id);
        segment::catalog_put(core, tx, &fresh)
    }

    fn drop_segment(&self, core: &Core, seg: &Segment, tx: &Arc<Transaction>) -> DbResult<()> {
        for extent in core.space.extents_of(core, seg.segment_id.to_raw())? {
            for p in 0..extent.size {
                core.buffers
                    .discard(FilePage::new(extent.start.file_id, extent.start.page_id + p));
            }
        }
        let _ = tx;
        Ok(())
    }

    fn redo(&self, page: &mut Page, rec: &LogRecord) -> DbResult<()> {
        if crate::segment::physical::is_physical(rec) {
            return crate::segment::physical::redo(page, rec);
        }
        let slot = rec
            .chunk_u16(tag::SLOT)
            .ok_or_else(|| DbError::Redo("tree record missing slot".to_string()))?
            as usize;
        let opcode = rec.require(tag::OP)?[0];
        match opcode {
            op::INSERT => {
                let mut entry = rec.require(tag::ENTRY)?.to_vec();
                Self::patch_undo(&mut entry, rec.undo_next);
                let replace = rec.chunk(tag::REPLACE).map(|r| r[0] != 0).unwrap_or(false);
                if replace {
                    TreeNode::dir().replace_row(page, slot, &entry);
                } else {
                    TreeNode::dir().insert_row_at(page, slot, &entry);
                }
            }
            op::REMOVE => {
                let replace = rec.chunk(tag::REPLACE).map(|r| r[0] != 0).unwrap_or(false);
                let mut e = TreeNode::leaf_entry(page, slot)?;
                e.flags = flags::DELETED
                    | flags::LOCKED
                    | if replace { flags::REPLACE } else { 0 };
                e.holder = rec.tx_id;
                e.undo = rec.undo_next;
                TreeNode::dir().replace_row(page, slot, &e.to_bytes());
            }
            op::SET => {
                let entry = rec.require(tag::ENTRY)?;
                TreeNode::dir().replace_row(page, slot, entry);
            }
            other => return Err(DbError::Redo(format!("unknown tree op {}", other))),
        }
        Ok(())
    }

    /// Logical undo: structural modifications may have moved the key to a
    /// different leaf since the update, so the record carries no page. The
    /// tree is re-descended by key and the inverse applied wherever the
    /// key now lives.
    fn undo(&self, core: &Core, rec: &LogRecord, tx: &Arc<Transaction>) -> DbResult<()> {
        if crate::segment::physical::is_physical(rec) {
            return crate::segment::physical::undo(core, rec, tx);
        }
        let segment_id = FilePage::from_raw(rec.segment_id)
            .ok_or_else(|| DbError::Rollback("tree undo without segment".to_string()))?;
        let tree = BTree::open(segment_id);
        let key = rec.require(tag::KEY)?.to_vec();
        let leaf = tree.descend_write(core, tx, &key)?;
        let applied = {
            let mut page = leaf.page_mut();
            TreeMethod::apply_inverse(rec, &mut page, |h| {
                h == 0 || core.pool.is_universally_committed(h)
            })?
        };
        let mut clr = LogRecord::new(RecordKind::Clr);
        clr.undo_next = rec.undo_next;
        clr.page_prev_undo = leaf.page().undo_next_lsn();
        clr.segment_id = rec.segment_id;
        clr.segment_type = SEG_TREE;
        match applied {
            Some((slot, restored)) => {
                clr.page = leaf.id().to_raw();
                clr.push(tag::OP, vec![op::SET]);
                clr.push_u16(tag::SLOT, slot as u16);
                clr.push(tag::ENTRY, restored);
                let lsn = core.txlog.append_clr(tx, Some(&leaf), clr)?;
                core.buffers.unpin_dirty(leaf, Affinity::Liked, lsn);
            }
            None => {
                core.buffers.unpin(leaf, Affinity::Liked);
                core.txlog.append_clr(tx, None, clr)?;
            }
        }
        Ok(())
    }

    /// Version reconstruction inverse: key-addressed and idempotent, so a
    /// chain entry that was already compensated at runtime re-applies to
    /// the same state.
    fn undo_into(&self, rec: &LogRecord, page: &mut Page) -> DbResult<()> {
        if crate::segment::physical::is_physical(rec) {
            return crate::segment::physical::undo_into(rec, page);
        }
        // prior holders are treated as still interesting here; version
        // reads re-check visibility on the restored entry themselves
        TreeMethod::apply_inverse(rec, page, |_| false).map(|_| ())
    }
}
