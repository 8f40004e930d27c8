use std::sync::Arc;

use tracing::{debug, info};

use crate::common::{DbError, DbResult};
use crate::config::{EXTENT_TABLE_PAGES, FREE_EXTENTS_PAGE, USED_EXTENTS_PAGE};
use crate::core::Core;
use crate::storage::FilePage;
use crate::tx::pool::Transaction;

pub mod extents;
pub use extents::{Extent, ExtentTable, SegExtent};

pub mod extender;
pub use extender::Extender;

/// Organizes files into coalescing extents via two catalog tables at fixed
/// locations in sys.db. Allocation runs inside a nested top action so the
/// free/used tables and the owning segment move together.
pub struct SpaceManager {
    free: ExtentTable,
    used: ExtentTable,
    pub extender: Arc<Extender>,
}

impl SpaceManager {
    pub fn new() -> Self {
        SpaceManager {
            free: ExtentTable::new(FREE_EXTENTS_PAGE, EXTENT_TABLE_PAGES),
            used: ExtentTable::new(USED_EXTENTS_PAGE, EXTENT_TABLE_PAGES),
            extender: Extender::new(),
        }
    }

    /// Move an extent from free to used under the caller's nested top
    /// action. Returns None when no free extent is large enough (the caller
    /// asks the extender and retries).
    pub fn try_allocate(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        owner: u64,
        size: u32,
    ) -> DbResult<Option<Extent>> {
        let mut free = self.free.load(core)?;
        let Some(extent) = ExtentTable::take_first_fit(&mut free, size) else {
            return Ok(None);
        };
        self.free.store(core, tx, &free)?;
        // a new segment owns itself: its id is its first page
        let owner = if owner == crate::storage::page::NONE_RAW {
            extent.start.to_raw()
        } else {
            owner
        };
        let mut used = self.used.load(core)?;
        ExtentTable::insert_owned(&mut used, extent, owner)?;
        self.used.store(core, tx, &used)?;
        debug!(start = %extent.start, size, owner, "extent allocated");
        Ok(Some(extent))
    }

    /// Allocate, growing the file through the extender when space runs out.
    pub fn allocate_extent(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        owner: u64,
        size: u32,
    ) -> DbResult<Extent> {
        for _ in 0..3 {
            let nta = core.txlog.begin_nested(tx);
            match self.try_allocate(core, tx, owner, size) {
                Ok(Some(extent)) => {
                    core.txlog.commit_nested(tx, nta)?;
                    return Ok(extent);
                }
                Ok(None) => {
                    core.txlog.commit_nested(tx, nta)?;
                    self.extender.request_and_wait(core, size)?;
                }
                Err(e) => {
                    core.txlog.rollback_nested(tx, nta, core)?;
                    return Err(e);
                }
            }
        }
        Err(DbError::OutOfSpace(format!(
            "no extent of {} pages obtainable",
            size
        )))
    }

    /// Return an extent to the free table, coalescing neighbors.
    pub fn free_extent(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        start: FilePage,
    ) -> DbResult<Extent> {
        let nta = core.txlog.begin_nested(tx);
        let res = (|| {
            let mut used = self.used.load(core)?;
            let removed = ExtentTable::remove_owned(&mut used, start)?;
            self.used.store(core, tx, &used)?;
            let mut free = self.free.load(core)?;
            ExtentTable::insert_coalescing(&mut free, removed.extent)?;
            self.free.store(core, tx, &free)?;
            Ok(removed.extent)
        })();
        match res {
            Ok(extent) => {
                core.txlog.commit_nested(tx, nta)?;
                Ok(extent)
            }
            Err(e) => {
                core.txlog.rollback_nested(tx, nta, core)?;
                Err(e)
            }
        }
    }

    /// Add a brand-new extent to the free table (file growth, bootstrap).
    pub fn insert_free_extent(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        extent: Extent,
    ) -> DbResult<()> {
        let mut free = self.free.load(core)?;
        ExtentTable::insert_coalescing(&mut free, extent)?;
        self.free.store(core, tx, &free)
    }

    /// Free extents matching a caller predicate (used by overlap checks and
    /// segment enumeration).
    pub fn find_free(
        &self,
        core: &Core,
        filter: impl Fn(&SegExtent) -> bool,
    ) -> DbResult<Option<SegExtent>> {
        Ok(ExtentTable::find_matching(&self.free.load(core)?, filter))
    }

    /// Every used extent owned by `owner`.
    pub fn extents_of(&self, core: &Core, owner: u64) -> DbResult<Vec<Extent>> {
        Ok(self
            .used
            .load(core)?
            .into_iter()
            .filter(|e| e.owner == owner)
            .map(|e| e.extent)
            .collect())
    }

    /// Free all of a segment's extents (segment drop).
    pub fn release_owner(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        owner: u64,
    ) -> DbResult<()> {
        for extent in self.extents_of(core, owner)? {
            self.free_extent(core, tx, extent.start)?;
        }
        Ok(())
    }

    /// Restart repair: pages a crashed extension added beyond the recorded
    /// file size go back on the free list.
    pub fn recover_file_tails(&self, core: &Core, tx: &Arc<Transaction>) -> DbResult<()> {
        let recorded = core.syskey.snapshot().file_pages;
        for file_id in core.files.ids() {
            let actual = core.files.get(file_id)?.page_count();
            let known = recorded
                .iter()
                .find(|(id, _)| *id == file_id)
                .map(|(_, p)| *p)
                .unwrap_or(actual);
            if actual > known {
                info!(file_id, known, actual, "reclaiming extended tail pages");
                let extent = Extent::new(FilePage::new(file_id, known), actual - known);
                let nta = core.txlog.begin_nested(tx);
                let mut free = self.free.load(core)?;
                // overlapping tail means the insert made it before the crash
                if ExtentTable::insert_coalescing(&mut free, extent).is_ok() {
                    self.free.store(core, tx, &free)?;
                }
                core.txlog.commit_nested(tx, nta)?;
            }
        }
        Ok(())
    }
}

impl Default for SpaceManager {
    fn default() -> Self {
        Self::new()
    }
}
