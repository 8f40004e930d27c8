use crate::buffer::{Affinity, BufferPool, LatchMode, PinnedPage};
use crate::common::DbResult;
use crate::log::{Lsn, NULL_LSN};
use crate::segment::SegmentFactory;
use crate::storage::{FilePage, Page};
use crate::tx::pool::Transaction;

/// A read view of a page: either the live frame (still latched SHARED) or a
/// private reconstructed copy when the live state is too new for the
/// caller's snapshot.
pub enum PageView {
    Current(PinnedPage),
    Version { id: FilePage, page: Box<Page> },
}

impl PageView {
    pub fn id(&self) -> FilePage {
        match self {
            PageView::Current(p) => p.id(),
            PageView::Version { id, .. } => *id,
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&Page) -> R) -> R {
        match self {
            PageView::Current(p) => f(&p.page()),
            PageView::Version { page, .. } => f(page),
        }
    }

    pub fn release(self, pool: &BufferPool) {
        if let PageView::Current(p) = self {
            pool.unpin(p, Affinity::Liked);
        }
    }
}

impl BufferPool {
    /// A view of the page as of `visibility` for `tx`'s snapshot. When the
    /// live page may carry effects newer than the visibility LSN or rows
    /// locked by transactions hidden from the snapshot, the frame is copied
    /// and undo records are applied in reverse chronological order, walking
    /// the page's undo chain, until the copy is stable.
    pub fn pin_version(
        &self,
        id: FilePage,
        tx: &Transaction,
        visibility: Lsn,
        factory: &SegmentFactory,
    ) -> DbResult<PageView> {
        let pinned = self.pin(id, LatchMode::Shared)?;
        let needs = self.needs_reconstruction(&pinned, tx, visibility)?;
        if !needs {
            return Ok(PageView::Current(pinned));
        }
        let mut copy = Box::new(pinned.page().clone());
        self.unpin(pinned, Affinity::Liked);

        let undo_base = self.log().undo_base();
        let stable_floor = tx.snapshot.commit_lsn.min(visibility);
        let mut ulsn = copy.undo_next_lsn();
        while ulsn != NULL_LSN && ulsn >= undo_base {
            let rec = self.log().read_undo(ulsn)?;
            if rec.pair_lsn != NULL_LSN && rec.pair_lsn < stable_floor {
                break;
            }
            if rec.pair_lsn > visibility || !tx.sees(rec.tx_id) {
                factory.method(rec.segment_type)?.undo_into(&rec, &mut copy)?;
            }
            copy.set_undo_next_lsn(rec.page_prev_undo);
            ulsn = rec.page_prev_undo;
        }
        Ok(PageView::Version { id, page: copy })
    }

    fn needs_reconstruction(
        &self,
        pinned: &PinnedPage,
        tx: &Transaction,
        visibility: Lsn,
    ) -> DbResult<bool> {
        let (first_lsn, ulsn) = {
            let page = pinned.page();
            (page.first_lsn(), page.undo_next_lsn())
        };
        if first_lsn > visibility {
            return Ok(true);
        }
        if ulsn == NULL_LSN || ulsn < self.log().undo_base() {
            return Ok(false);
        }
        let rec = self.log().read_undo(ulsn)?;
        Ok(rec.pair_lsn > visibility || !tx.sees(rec.tx_id))
    }
}
