use std::sync::Arc;

use tracing::{debug, trace};

use crate::buffer::{Affinity, LatchMode, PinnedPage};
use crate::common::{DbError, DbResult};
use crate::config::{LOAD_MAX_PERCENT, LOAD_MIN_PERCENT};
use crate::core::Core;
use crate::log::record::tag;
use crate::log::{LogRecord, Lsn, RecordKind};
use crate::segment::{self, Segment, SegmentMethod, SEG_DATASET};
use crate::storage::page::page_type;
use crate::storage::{FilePage, Page, Rowid};
use crate::tx::pool::Transaction;

pub mod row_page;
pub use row_page::{flags, RowPage, ROW_OVERHEAD};

/// Dataset record sub-operations, carried in the OP chunk.
pub mod op {
    pub const INSERT: u8 = 1;
    pub const REMOVE: u8 = 2;
    pub const UPDATE: u8 = 3;
    pub const LOCK: u8 = 4;
    /// CLR payload: the row state after an undo was applied.
    pub const SET: u8 = 5;
}

/// Optional row predicate consulted by fetches and scans.
pub trait RowFilter {
    fn passes(&self, row: &[u8]) -> bool;
}

/// Row-level lock acquisition against the header flags of a slot. Returns
/// the previous holder on grant.
pub fn check_row_lock(core: &Core, tx: &Transaction, row_flags: u8, holder: u64) -> DbResult<u64> {
    if row_flags & flags::LOCKED == 0 {
        return Ok(0);
    }
    if holder == tx.id {
        return Ok(holder);
    }
    if tx.snapshot.is_committed(holder) {
        // the holder committed before our snapshot: steal the lock
        return Ok(holder);
    }
    if tx.serializable {
        return Err(DbError::SerializationConflict);
    }
    if core.pool.master_committed(holder) {
        // read-committed reads the latest committed state, so a holder
        // that finished after our snapshot is stealable too
        return Ok(holder);
    }
    Err(DbError::LockConflict { holder })
}

/// An unordered row dataset: rowid-addressed inserts, updates and deletes
/// with row-header locks, and a free-page list of pages with reusable space.
#[derive(Clone, Copy)]
pub struct Dataset {
    pub segment_id: FilePage,
}

impl Dataset {
    pub fn open(segment_id: FilePage) -> Self {
        Dataset { segment_id }
    }

    pub fn create(core: &Core, tx: &Arc<Transaction>) -> DbResult<Self> {
        let seg = segment::create_segment(core, tx, SEG_DATASET)?;
        Ok(Dataset {
            segment_id: seg.segment_id,
        })
    }

    fn seg(&self, core: &Core) -> DbResult<Segment> {
        segment::catalog_lookup(core, self.segment_id)?
            .ok_or_else(|| DbError::Storage(format!("dataset {} not found", self.segment_id)))
    }

    /// Insert a row; returns its rowid. The slot is locked by `tx` until
    /// commit (the lock is implicit: the slot was created or reserved by
    /// this transaction).
    pub fn insert(&self, core: &Core, tx: &Arc<Transaction>, payload: &[u8]) -> DbResult<Rowid> {
        let needed = ROW_OVERHEAD + payload.len();
        if needed + 2 > RowPage::usable() {
            return Err(DbError::Storage(format!(
                "row of {} bytes exceeds a page",
                payload.len()
            )));
        }
        loop {
            tx.check_cancelled()?;
            let seg = self.seg(core)?;
            let target = match seg.free_page {
                Some(p) => p,
                None => self.grow(core, tx, &seg)?,
            };
            let pinned = core.buffers.pin(target, LatchMode::Exclusive)?;
            let dir = RowPage::dir();
            // prepare slot: reuse a deleted slot whose deleter can no
            // longer roll back, else push a new one
            let (slot, reused_prev) = {
                let page = pinned.page();
                let n = dir.count(&page);
                let mut found = None;
                for i in 0..n {
                    let f = RowPage::row_flags(&page, i);
                    if f & flags::DELETED == 0 {
                        continue;
                    }
                    let holder = RowPage::row_holder(&page, i);
                    let safe = f & flags::LOCKED == 0
                        || holder == tx.id
                        || core.pool.is_universally_committed(holder);
                    if safe && dir.row_len(&page, i) >= needed {
                        found = Some((i, dir.row(&page, i).to_vec()));
                        break;
                    }
                }
                match found {
                    Some((i, prev)) => (Some(i), Some(prev)),
                    None => {
                        if !dir.fits(&page, needed) {
                            drop(page);
                            core.buffers.unpin(pinned, Affinity::Liked);
                            self.pop_space_head(core, tx, target)?;
                            continue;
                        }
                        (None, None)
                    }
                }
            };
            let row = RowPage::build_row(flags::LOCKED, tx.id, payload);
            let slot = {
                let mut page = pinned.page_mut();
                match slot {
                    Some(i) => {
                        dir.replace_row(&mut page, i, &row);
                        let dc = RowPage::delete_count(&page).saturating_sub(1);
                        RowPage::set_delete_count(&mut page, dc);
                        i
                    }
                    None => dir.push_row(&mut page, &row),
                }
            };
            let mut undo = LogRecord::new(RecordKind::Update);
            let mut redo = LogRecord::new(RecordKind::Update);
            for rec in [&mut undo, &mut redo] {
                rec.segment_id = self.segment_id.to_raw();
                rec.page = target.to_raw();
                rec.segment_type = SEG_DATASET;
                rec.page_type = page_type::ROW;
                rec.push(tag::OP, vec![op::INSERT]);
                rec.push_u16(tag::SLOT, slot as u16);
            }
            redo.push(tag::ROW, row);
            redo.push(tag::REPLACE, vec![reused_prev.is_some() as u8]);
            if let Some(prev) = reused_prev {
                undo.push(tag::PREV_ENTRY, prev);
            }
            let lsn = core.txlog.write_undo_redo(tx, &pinned, undo, redo)?;
            let rowid = Rowid::new(target, slot as i16);
            self.after_write(core, tx, pinned, lsn)?;
            tx.note_lock(rowid);
            trace!(tx = tx.id, rowid = ?rowid, "row inserted");
            return Ok(rowid);
        }
    }

    /// Delete the row, keeping the slot (and the deleter's lock) until the
    /// deletion is universally committed. Returns false when the row is
    /// already gone.
    pub fn remove(&self, core: &Core, tx: &Arc<Transaction>, rowid: Rowid) -> DbResult<bool> {
        loop {
            tx.check_cancelled()?;
            let pinned = core.buffers.pin(rowid.page, LatchMode::Exclusive)?;
            let slot = rowid.index as usize;
            let (row_flags, holder) = {
                let page = pinned.page();
                let n = RowPage::dir().count(&page);
                if rowid.index < 0 || slot >= n {
                    return Err(DbError::Storage(format!("no slot {} on {}", slot, rowid.page)));
                }
                (RowPage::row_flags(&page, slot), RowPage::row_holder(&page, slot))
            };
            if row_flags & flags::DELETED != 0 {
                if row_flags & flags::LOCKED != 0
                    && !tx.sees(holder)
                    && !core.pool.master_committed(holder)
                {
                    // the deleter may still roll back; wait it out
                    core.buffers.unpin(pinned, Affinity::Liked);
                    core.detector.wait_for(tx, holder)?;
                    continue;
                }
                core.buffers.unpin(pinned, Affinity::Liked);
                return Ok(false);
            }
            let prev = match check_row_lock(core, tx, row_flags, holder) {
                Ok(prev) => prev,
                Err(DbError::LockConflict { holder }) => {
                    core.buffers.unpin(pinned, Affinity::Liked);
                    core.detector.wait_for(tx, holder)?;
                    continue;
                }
                Err(e) => {
                    core.buffers.unpin(pinned, Affinity::Liked);
                    return Err(e);
                }
            };
            let mut undo = LogRecord::new(RecordKind::Update);
            let mut redo = LogRecord::new(RecordKind::Update);
            for rec in [&mut undo, &mut redo] {
                rec.segment_id = self.segment_id.to_raw();
                rec.page = rowid.page.to_raw();
                rec.segment_type = SEG_DATASET;
                rec.page_type = page_type::ROW;
                rec.push(tag::OP, vec![op::REMOVE]);
                rec.push_u16(tag::SLOT, slot as u16);
            }
            undo.push(tag::FLAGS, vec![row_flags]);
            undo.push_u64(tag::HOLDER, prev);
            {
                let mut page = pinned.page_mut();
                RowPage::set_row_flags(&mut page, slot, flags::DELETED | flags::LOCKED);
                RowPage::set_row_holder(&mut page, slot, tx.id);
                let dc = RowPage::delete_count(&page) + 1;
                RowPage::set_delete_count(&mut page, dc);
            }
            let lsn = core.txlog.write_undo_redo(tx, &pinned, undo, redo)?;
            self.after_write(core, tx, pinned, lsn)?;
            tx.note_lock(rowid);
            trace!(tx = tx.id, rowid = ?rowid, "row removed");
            return Ok(true);
        }
    }

    /// Rewrite the row in place. A row that outgrows its page is rejected;
    /// the LINKED flag and continuation field are the hook for a future
    /// overflow chain.
    pub fn update(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        rowid: Rowid,
        payload: &[u8],
    ) -> DbResult<()> {
        loop {
            tx.check_cancelled()?;
            let pinned = core.buffers.pin(rowid.page, LatchMode::Exclusive)?;
            let slot = rowid.index as usize;
            let dir = RowPage::dir();
            let (row_flags, holder, old_row, room) = {
                let page = pinned.page();
                let n = dir.count(&page);
                if rowid.index < 0 || slot >= n {
                    return Err(DbError::Storage(format!("no slot {} on {}", slot, rowid.page)));
                }
                (
                    RowPage::row_flags(&page, slot),
                    RowPage::row_holder(&page, slot),
                    dir.row(&page, slot).to_vec(),
                    dir.free_bytes(&page) + dir.row_len(&page, slot),
                )
            };
            if row_flags & flags::DELETED != 0 {
                if row_flags & flags::LOCKED != 0
                    && !tx.sees(holder)
                    && !core.pool.master_committed(holder)
                {
                    core.buffers.unpin(pinned, Affinity::Liked);
                    core.detector.wait_for(tx, holder)?;
                    continue;
                }
                return Err(DbError::Storage("row is deleted".to_string()));
            }
            match check_row_lock(core, tx, row_flags, holder) {
                Ok(_) => {}
                Err(DbError::LockConflict { holder }) => {
                    core.buffers.unpin(pinned, Affinity::Liked);
                    core.detector.wait_for(tx, holder)?;
                    continue;
                }
                Err(e) => return Err(e),
            }
            let needed = ROW_OVERHEAD + payload.len();
            if needed > room {
                return Err(DbError::Storage(
                    "updated row exceeds page capacity".to_string(),
                ));
            }
            let new_row = RowPage::build_row(flags::LOCKED, tx.id, payload);
            let mut undo = LogRecord::new(RecordKind::Update);
            let mut redo = LogRecord::new(RecordKind::Update);
            for rec in [&mut undo, &mut redo] {
                rec.segment_id = self.segment_id.to_raw();
                rec.page = rowid.page.to_raw();
                rec.segment_type = SEG_DATASET;
                rec.page_type = page_type::ROW;
                rec.push(tag::OP, vec![op::UPDATE]);
                rec.push_u16(tag::SLOT, slot as u16);
            }
            undo.push(tag::PREV_ENTRY, old_row);
            redo.push(tag::ROW, new_row.clone());
            {
                let mut page = pinned.page_mut();
                dir.replace_row(&mut page, slot, &new_row);
            }
            let lsn = core.txlog.write_undo_redo(tx, &pinned, undo, redo)?;
            self.after_write(core, tx, pinned, lsn)?;
            tx.note_lock(rowid);
            return Ok(());
        }
    }

    /// Consistent read through the MVCC page view.
    pub fn fetch(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        rowid: Rowid,
    ) -> DbResult<Option<Vec<u8>>> {
        let visibility = core.log.stability_point();
        let view = core
            .buffers
            .pin_version(rowid.page, tx, visibility, &core.factory)?;
        let res = view.with(|page| Self::read_slot(page, rowid.index, tx));
        view.release(&core.buffers);
        Ok(res)
    }

    fn read_slot(page: &Page, index: i16, tx: &Transaction) -> Option<Vec<u8>> {
        let slot = index as usize;
        if index < 0 || slot >= RowPage::dir().count(page) {
            return None;
        }
        let f = RowPage::row_flags(page, slot);
        let holder = RowPage::row_holder(page, slot);
        if f & flags::LOCKED != 0 && !tx.sees(holder) {
            return None;
        }
        if f & flags::DELETED != 0 {
            return None;
        }
        Some(RowPage::row_payload(page, slot).to_vec())
    }

    /// "For-update" read: exclusive latch, row lock taken and logged so the
    /// lock survives restart.
    pub fn fetch_for_update(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        rowid: Rowid,
    ) -> DbResult<Option<Vec<u8>>> {
        loop {
            tx.check_cancelled()?;
            let pinned = core.buffers.pin(rowid.page, LatchMode::Exclusive)?;
            let slot = rowid.index as usize;
            let (row_flags, holder, payload) = {
                let page = pinned.page();
                if rowid.index < 0 || slot >= RowPage::dir().count(&page) {
                    return Ok(None);
                }
                (
                    RowPage::row_flags(&page, slot),
                    RowPage::row_holder(&page, slot),
                    RowPage::row_payload(&page, slot).to_vec(),
                )
            };
            if row_flags & flags::DELETED != 0 {
                if row_flags & flags::LOCKED != 0
                    && !tx.sees(holder)
                    && !core.pool.master_committed(holder)
                {
                    core.buffers.unpin(pinned, Affinity::Liked);
                    core.detector.wait_for(tx, holder)?;
                    continue;
                }
                core.buffers.unpin(pinned, Affinity::Liked);
                return Ok(None);
            }
            let prev = match check_row_lock(core, tx, row_flags, holder) {
                Ok(prev) => prev,
                Err(DbError::LockConflict { holder }) => {
                    core.buffers.unpin(pinned, Affinity::Liked);
                    core.detector.wait_for(tx, holder)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if row_flags & flags::LOCKED != 0 && holder == tx.id {
                // already ours; nothing to log
                core.buffers.unpin(pinned, Affinity::Liked);
                return Ok(Some(payload));
            }
            let mut undo = LogRecord::new(RecordKind::Update);
            let mut redo = LogRecord::new(RecordKind::Update);
            for rec in [&mut undo, &mut redo] {
                rec.segment_id = self.segment_id.to_raw();
                rec.page = rowid.page.to_raw();
                rec.segment_type = SEG_DATASET;
                rec.page_type = page_type::ROW;
                rec.push(tag::OP, vec![op::LOCK]);
                rec.push_u16(tag::SLOT, slot as u16);
            }
            undo.push(tag::FLAGS, vec![row_flags]);
            undo.push_u64(tag::HOLDER, prev);
            redo.push(tag::FLAGS, vec![row_flags | flags::LOCKED]);
            redo.push_u64(tag::HOLDER, tx.id);
            {
                let mut page = pinned.page_mut();
                RowPage::set_row_flags(&mut page, slot, row_flags | flags::LOCKED);
                RowPage::set_row_holder(&mut page, slot, tx.id);
            }
            let lsn = core.txlog.write_undo_redo(tx, &pinned, undo, redo)?;
            core.buffers.unpin_dirty(pinned, Affinity::Liked, lsn);
            tx.note_lock(rowid);
            return Ok(Some(payload));
        }
    }

    /// Open a forward/backward scan. The cursor captures its stability
    /// point at open.
    pub fn scan(&self, core: &Core) -> DbResult<DatasetScan> {
        let seg = self.seg(core)?;
        let root = seg
            .data_root
            .ok_or_else(|| DbError::Storage("dataset has no pages".to_string()))?;
        Ok(DatasetScan {
            dataset: *self,
            visibility: core.log.stability_point(),
            pos: Rowid::new(root, Rowid::BEFORE_FIRST),
            open: true,
        })
    }

    /// Unpin after a logged write, then adjust free-list membership by the
    /// page's new load factor.
    fn after_write(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        pinned: PinnedPage,
        lsn: Lsn,
    ) -> DbResult<()> {
        let target = pinned.id();
        let (load, on_list) = {
            let page = pinned.page();
            (RowPage::load_percent(&page), RowPage::on_free_list(&page))
        };
        core.buffers.unpin_dirty(pinned, Affinity::Liked, lsn);
        if load > LOAD_MAX_PERCENT && on_list {
            self.pop_space_head(core, tx, target)?;
        } else if load < LOAD_MIN_PERCENT && !on_list {
            self.push_space(core, tx, target)?;
        }
        Ok(())
    }

    /// Allocate, initialize and link a fresh row page, placing it at the
    /// head of the free-space list. Atomic nested top action.
    fn grow(&self, core: &Core, tx: &Arc<Transaction>, seg: &Segment) -> DbResult<FilePage> {
        let nta = core.txlog.begin_nested(tx);
        let res = (|| {
            let root = seg
                .data_root
                .ok_or_else(|| DbError::Storage("dataset has no root page".to_string()))?;
            let page_id = segment::allocate_page(core, tx, self.segment_id)?;
            let mut fresh = self.seg(core)?;
            let pinned = core.buffers.pin_new(page_id)?;
            let before = pinned.page().clone();
            let old_next = {
                let root_pin = core.buffers.pin(root, LatchMode::Shared)?;
                let n = RowPage::next_page(&root_pin.page());
                core.buffers.unpin(root_pin, Affinity::Loved);
                n
            };
            {
                let mut page = pinned.page_mut();
                RowPage::init(&mut page, SEG_DATASET);
                RowPage::set_prev_page(&mut page, Some(root));
                RowPage::set_next_page(&mut page, old_next);
                RowPage::set_on_free_list(&mut page, true);
                RowPage::set_next_free_page(&mut page, fresh.free_page);
            }
            if let Some(lsn) = core.txlog.log_page_change(
                tx,
                &pinned,
                &before,
                self.segment_id.to_raw(),
                SEG_DATASET,
                page_type::ROW,
            )? {
                core.buffers.unpin_dirty(pinned, Affinity::Liked, lsn);
            } else {
                core.buffers.unpin(pinned, Affinity::Liked);
            }
            // stitch into the page chain behind the root
            let root_pin = core.buffers.pin(root, LatchMode::Exclusive)?;
            let before = root_pin.page().clone();
            RowPage::set_next_page(&mut root_pin.page_mut(), Some(page_id));
            if let Some(lsn) = core.txlog.log_page_change(
                tx,
                &root_pin,
                &before,
                self.segment_id.to_raw(),
                SEG_DATASET,
                page_type::ROW,
            )? {
                core.buffers.unpin_dirty(root_pin, Affinity::Liked, lsn);
            } else {
                core.buffers.unpin(root_pin, Affinity::Liked);
            }
            if let Some(next) = old_next {
                let next_pin = core.buffers.pin(next, LatchMode::Exclusive)?;
                let before = next_pin.page().clone();
                RowPage::set_prev_page(&mut next_pin.page_mut(), Some(page_id));
                if let Some(lsn) = core.txlog.log_page_change(
                    tx,
                    &next_pin,
                    &before,
                    self.segment_id.to_raw(),
                    SEG_DATASET,
                    page_type::ROW,
                )? {
                    core.buffers.unpin_dirty(next_pin, Affinity::Liked, lsn);
                } else {
                    core.buffers.unpin(next_pin, Affinity::Liked);
                }
            }
            fresh.free_page = Some(page_id);
            segment::catalog_put(core, tx, &fresh)?;
            Ok(page_id)
        })();
        match res {
            Ok(p) => {
                core.txlog.commit_nested(tx, nta)?;
                debug!(dataset = %self.segment_id, page = %p, "dataset grew");
                Ok(p)
            }
            Err(e) => {
                core.txlog.rollback_nested(tx, nta, core)?;
                Err(e)
            }
        }
    }

    /// Pop `head` from the free-space list (it is the current head).
    fn pop_space_head(&self, core: &Core, tx: &Arc<Transaction>, head: FilePage) -> DbResult<()> {
        let nta = core.txlog.begin_nested(tx);
        let res = (|| {
            let mut seg = self.seg(core)?;
            if seg.free_page != Some(head) {
                return Ok(()); // someone else already moved the list
            }
            let pinned = core.buffers.pin(head, LatchMode::Exclusive)?;
            let before = pinned.page().clone();
            let next = RowPage::next_free_page(&pinned.page());
            {
                let mut page = pinned.page_mut();
                RowPage::set_on_free_list(&mut page, false);
                RowPage::set_next_free_page(&mut page, None);
            }
            if let Some(lsn) = core.txlog.log_page_change(
                tx,
                &pinned,
                &before,
                self.segment_id.to_raw(),
                SEG_DATASET,
                page_type::ROW,
            )? {
                core.buffers.unpin_dirty(pinned, Affinity::Liked, lsn);
            } else {
                core.buffers.unpin(pinned, Affinity::Liked);
            }
            seg.free_page = next;
            segment::catalog_put(core, tx, &seg)
        })();
        match res {
            Ok(()) => core.txlog.commit_nested(tx, nta),
            Err(e) => {
                core.txlog.rollback_nested(tx, nta, core)?;
                Err(e)
            }
        }
    }

    /// Push a page whose load dropped below the threshold onto the list.
    fn push_space(&self, core: &Core, tx: &Arc<Transaction>, page_id: FilePage) -> DbResult<()> {
        let nta = core.txlog.begin_nested(tx);
        let res = (|| {
            let mut seg = self.seg(core)?;
            let pinned = core.buffers.pin(page_id, LatchMode::Exclusive)?;
            if RowPage::on_free_list(&pinned.page()) {
                core.buffers.unpin(pinned, Affinity::Liked);
                return Ok(());
            }
            let before = pinned.page().clone();
            {
                let mut page = pinned.page_mut();
                RowPage::set_on_free_list(&mut page, true);
                RowPage::set_next_free_page(&mut page, seg.free_page);
            }
            if let Some(lsn) = core.txlog.log_page_change(
                tx,
                &pinned,
                &before,
                self.segment_id.to_raw(),
                SEG_DATASET,
                page_type::ROW,
            )? {
                core.buffers.unpin_dirty(pinned, Affinity::Liked, lsn);
            } else {
                core.buffers.unpin(pinned, Affinity::Liked);
            }
            seg.free_page = Some(page_id);
            segment::catalog_put(core, tx, &seg)
        })();
        match res {
            Ok(()) => core.txlog.commit_nested(tx, nta),
            Err(e) => {
                core.txlog.rollback_nested(tx, nta, core)?;
                Err(e)
            }
        }
    }
}

/// A resumable forward/backward dataset iterator with an explicit
/// open/close lifecycle. Cheap to copy; the position is the iterator state.
#[derive(Clone)]
pub struct DatasetScan {
    dataset: Dataset,
    visibility: Lsn,
    pos: Rowid,
    open: bool,
}

impl DatasetScan {
    pub fn position(&self) -> Rowid {
        self.pos
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn next(
        &mut self,
        core: &Core,
        tx: &Arc<Transaction>,
        filter: Option<&dyn RowFilter>,
    ) -> DbResult<Option<(Rowid, Vec<u8>)>> {
        self.step(core, tx, filter, false)
    }

    pub fn prev(
        &mut self,
        core: &Core,
        tx: &Arc<Transaction>,
        filter: Option<&dyn RowFilter>,
    ) -> DbResult<Option<(Rowid, Vec<u8>)>> {
        self.step(core, tx, filter, true)
    }

    fn step(
        &mut self,
        core: &Core,
        tx: &Arc<Transaction>,
        filter: Option<&dyn RowFilter>,
        reverse: bool,
    ) -> DbResult<Option<(Rowid, Vec<u8>)>> {
        if !self.open {
            return Err(DbError::Storage("scan is closed".to_string()));
        }
        loop {
            tx.check_cancelled()?;
            let view =
                core.buffers
                    .pin_version(self.pos.page, tx, self.visibility, &core.factory)?;
            enum Step {
                Hit(usize, Vec<u8>),
                Jump(Option<FilePage>),
            }
            let outcome = view.with(|page| {
                let dir = RowPage::dir();
                let n = dir.count(page) as i32;
                let mut i: i32 = if reverse {
                    if self.pos.index == Rowid::AFTER_LAST {
                        n - 1
                    } else {
                        self.pos.index as i32 - 1
                    }
                } else if self.pos.index == Rowid::BEFORE_FIRST {
                    0
                } else {
                    self.pos.index as i32 + 1
                };
                while i >= 0 && i < n {
                    if let Some(payload) = Dataset::read_slot(page, i as i16, tx) {
                        if filter.map(|f| f.passes(&payload)).unwrap_or(true) {
                            return Step::Hit(i as usize, payload);
                        }
                    }
                    i += if reverse { -1 } else { 1 };
                }
                Step::Jump(if reverse {
                    RowPage::prev_page(page)
                } else {
                    RowPage::next_page(page)
                })
            });
            view.release(&core.buffers);
            match outcome {
                Step::Hit(i, payload) => {
                    self.pos.index = i as i16;
                    return Ok(Some((Rowid::new(self.pos.page, i as i16), payload)));
                }
                Step::Jump(Some(next)) => {
                    self.pos = Rowid::new(
                        next,
                        if reverse {
                            Rowid::AFTER_LAST
                        } else {
                            Rowid::BEFORE_FIRST
                        },
                    );
                }
                Step::Jump(None) => return Ok(None),
            }
        }
    }
}

/// The dataset's segment method: physical redo plus the typed row
/// operations, their inverses, and the buffer-only inverse for version
/// reconstruction.
pub struct DatasetMethod;

impl DatasetMethod {
    fn apply_inverse(rec: &LogRecord, page: &mut Page) -> DbResult<Vec<u8>> {
        let dir = RowPage::dir();
        let slot = rec
            .chunk_u16(tag::SLOT)
            .ok_or_else(|| DbError::Storage("record missing slot".to_string()))?
            as usize;
        let opcode = rec.require(tag::OP)?[0];
        match opcode {
            op::INSERT => {
                let restored = match rec.chunk(tag::PREV_ENTRY) {
                    Some(prev) => prev.to_vec(),
                    None => {
                        let mut cur = dir.row(page, slot).to_vec();
                        cur[0] = flags::DELETED | flags::LOCKED;
                        cur
                    }
                };
                dir.replace_row(page, slot, &restored);
                let dc = RowPage::delete_count(page) + 1;
                RowPage::set_delete_count(page, dc);
                Ok(dir.row(page, slot).to_vec())
            }
            op::REMOVE => {
                let old_flags = rec.require(tag::FLAGS)?[0];
                let holder = rec.chunk_u64(tag::HOLDER).unwrap_or(0);
                RowPage::set_row_flags(page, slot, old_flags);
                RowPage::set_row_holder(page, slot, holder);
                let dc = RowPage::delete_count(page).saturating_sub(1);
                RowPage::set_delete_count(page, dc);
                Ok(dir.row(page, slot).to_vec())
            }
            op::UPDATE => {
                let prev = rec.require(tag::PREV_ENTRY)?.to_vec();
                dir.replace_row(page, slot, &prev);
                Ok(prev)
            }
            op::LOCK => {
                let old_flags = rec.require(tag::FLAGS)?[0];
                let holder = rec.chunk_u64(tag::HOLDER).unwrap_or(0);
                RowPage::set_row_flags(page, slot, old_flags);
                RowPage::set_row_holder(page, slot, holder);
                Ok(dir.row(page, slot).to_vec())
            }
            other => Err(DbError::Storage(format!(
                "unknown dataset op {} in undo",
                other
            ))),
        }
    }
}

impl SegmentMethod for DatasetMethod {
    fn segment_type(&self) -> u8 {
        SEG_DATASET
    }

    fn name(&self) -> &'static str {
        "dataset"
    }

    fn create(&self, core: &Core, seg: &Segment, tx: &Arc<Transaction>) -> DbResult<()> {
        let page_id = segment::allocate_page(core, tx, seg.segment_id)?;
        let pinned = core.buffers.pin_new(page_id)?;
        let before = pinned.page().clone();
        {
            let mut page = pinned.page_mut();
            RowPage::init(&mut page, SEG_DATASET);
            RowPage::set_on_free_list(&mut page, true);
        }
        if let Some(lsn) = core.txlog.log_page_change(
            tx,
            &pinned,
            &before,
            seg.segment_id.to_raw(),
            SEG_DATASET,
            page_type::ROW,
        )? {
            core.buffers.unpin_dirty(pinned, Affinity::Liked, lsn);
        } else {
            core.buffers.unpin(pinned, Affinity::Liked);
        }
        let mut fresh = segment::catalog_lookup(core, seg.segment_id)?
            .ok_or_else(|| DbError::Storage("segment missing during create".to_string()))?;
        fresh.data_root = Some(page_id);
        fresh.free_page = Some(page_id);
        segment::catalog_put(core, tx, &fresh)
    }

    fn drop_segment(&self, core: &Core, seg: &Segment, tx: &Arc<Transaction>) -> DbResult<()> {
        // extents go back to the free table in drop_segment's bracket;
        // cached frames for this segment must not flush over reused pages
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
        let dir = RowPage::dir();
        let slot = rec
            .chunk_u16(tag::SLOT)
            .ok_or_else(|| DbError::Redo("record missing slot".to_string()))? as usize;
        let opcode = rec.require(tag::OP)?[0];
        match opcode {
            op::INSERT => {
                let row = rec.require(tag::ROW)?;
                let replace = rec.chunk(tag::REPLACE).map(|r| r[0] != 0).unwrap_or(false);
                if replace {
                    dir.replace_row(page, slot, row);
                    let dc = RowPage::delete_count(page).saturating_sub(1);
                    RowPage::set_delete_count(page, dc);
                } else {
                    dir.insert_row_at(page, slot, row);
                }
            }
            op::REMOVE => {
                RowPage::set_row_flags(page, slot, flags::DELETED | flags::LOCKED);
                RowPage::set_row_holder(page, slot, rec.tx_id);
                let dc = RowPage::delete_count(page) + 1;
                RowPage::set_delete_count(page, dc);
            }
            op::UPDATE => {
                let row = rec.require(tag::ROW)?;
                dir.replace_row(page, slot, row);
            }
            op::LOCK => {
                let f = rec.require(tag::FLAGS)?[0];
                let holder = rec.chunk_u64(tag::HOLDER).unwrap_or(0);
                RowPage::set_row_flags(page, slot, f);
                RowPage::set_row_holder(page, slot, holder);
            }
            op::SET => {
                let row = rec.require(tag::ROW)?;
                dir.replace_row(page, slot, row);
                if let Some(dc) = rec.chunk_u16(tag::COUNT) {
                    RowPage::set_delete_count(page, dc);
                }
            }
            other => return Err(DbError::Redo(format!("unknown dataset op {}", other))),
        }
        Ok(())
    }

    fn undo(&self, core: &Core, rec: &LogRecord, tx: &Arc<Transaction>) -> DbResult<()> {
        if crate::segment::physical::is_physical(rec) {
            return crate::segment::physical::undo(core, rec, tx);
        }
        let id = FilePage::from_raw(rec.page)
            .ok_or_else(|| DbError::Rollback("dataset undo without page".to_string()))?;
        let pinned = core.buffers.pin(id, LatchMode::Exclusive)?;
        let (restored, count) = {
            let mut page = pinned.page_mut();
            let restored = Self::apply_inverse(rec, &mut page)?;
            page.set_undo_next_lsn(rec.page_prev_undo);
            (restored, RowPage::delete_count(&page))
        };
        let mut clr = LogRecord::new(RecordKind::Clr);
        clr.undo_next = rec.undo_next;
        clr.page_prev_undo = rec.page_prev_undo;
        clr.segment_id = rec.segment_id;
        clr.page = rec.page;
        clr.segment_type = rec.segment_type;
        clr.page_type = rec.page_type;
        clr.push(tag::OP, vec![op::SET]);
        clr.push_u16(tag::SLOT, rec.chunk_u16(tag::SLOT).unwrap_or(0));
        clr.push(tag::ROW, restored);
        clr.push_u16(tag::COUNT, count);
        let lsn = core.txlog.append_clr(tx, Some(&pinned), clr)?;
        core.buffers.unpin_dirty(pinned, Affinity::Liked, lsn);
        Ok(())
    }

    fn undo_into(&self, rec: &LogRecord, page: &mut Page) -> DbResult<()> {
        if crate::segment::physical::is_physical(rec) {
            return crate::segment::physical::undo_into(rec, page);
        }
        Self::apply_inverse(rec, page).map(|_| ())
    }
}
