use tracing::debug;

use crate::buffer::{Affinity, LatchMode};
use crate::common::{DbError, DbResult};
use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE, SYS_FILE_ID};
use crate::core::Core;
use crate::segment::SEG_SPACE;
use crate::storage::page::{page_type, NONE_RAW};
use crate::storage::FilePage;
use crate::tx::pool::Transaction;
use std::sync::Arc;

/// A run of contiguous pages within one file.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Extent {
    pub start: FilePage,
    pub size: u32,
}

impl Extent {
    pub fn new(start: FilePage, size: u32) -> Self {
        Extent { start, size }
    }
    pub fn end(&self) -> u32 {
        self.start.page_id + self.size
    }
    pub fn contains(&self, page: FilePage) -> bool {
        page.file_id == self.start.file_id
            && page.page_id >= self.start.page_id
            && page.page_id < self.end()
    }
}

/// An extent plus its owning segment (NONE for free extents).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SegExtent {
    pub extent: Extent,
    pub owner: u64,
}

const ENTRY_SIZE: usize = 20;
const BODY: usize = PAGE_HEADER_SIZE;
const PER_PAGE: usize = (PAGE_SIZE - BODY - 2) / ENTRY_SIZE;

/// A sorted page-array of extents keyed by `(file_id, start_page_id)`,
/// spanning a fixed run of pages in sys.db. Entries are kept packed: every
/// page before the last non-empty one is full.
pub struct ExtentTable {
    first_page: u32,
    span: u32,
}

impl ExtentTable {
    pub fn new(first_page: u32, span: u32) -> Self {
        ExtentTable { first_page, span }
    }

    pub fn capacity(&self) -> usize {
        PER_PAGE * self.span as usize
    }

    fn page_id(&self, idx: u32) -> FilePage {
        FilePage::new(SYS_FILE_ID, self.first_page + idx)
    }

    /// Read the whole logical array.
    pub fn load(&self, core: &Core) -> DbResult<Vec<SegExtent>> {
        let mut out = Vec::new();
        for i in 0..self.span {
            let pinned = core.buffers.pin(self.page_id(i), LatchMode::Shared)?;
            {
                let page = pinned.page();
                let count = page.read_u16(BODY) as usize;
                for j in 0..count {
                    let off = BODY + 2 + j * ENTRY_SIZE;
                    let raw = page.read_u64(off);
                    let size = page.read_u32(off + 8);
                    let owner = page.read_u64(off + 12);
                    out.push(SegExtent {
                        extent: Extent {
                            start: FilePage::from_raw(raw)
                                .ok_or_else(|| DbError::Storage("bad extent entry".into()))?,
                            size,
                        },
                        owner,
                    });
                }
            }
            core.buffers.unpin(pinned, Affinity::Loved);
        }
        Ok(out)
    }

    /// Write the array back, logging a physical undo/redo pair for every
    /// page whose image changed. Runs inside the caller's transaction
    /// (usually a nested top action).
    pub fn store(
        &self,
        core: &Core,
        tx: &Arc<Transaction>,
        entries: &[SegExtent],
    ) -> DbResult<()> {
        if entries.len() > self.capacity() {
            return Err(DbError::OutOfSpace(format!(
                "extent table at page {} overflow ({} entries)",
                self.first_page,
                entries.len()
            )));
        }
        for i in 0..self.span {
            let chunk_start = i as usize * PER_PAGE;
            let chunk = if chunk_start < entries.len() {
                &entries[chunk_start..entries.len().min(chunk_start + PER_PAGE)]
            } else {
                &[]
            };
            let pinned = core.buffers.pin(self.page_id(i), LatchMode::Exclusive)?;
            let before = pinned.page().clone();
            {
                let mut page = pinned.page_mut();
                page.set_segment_type(SEG_SPACE);
                page.set_page_type(page_type::EXTENTS);
                // canonical body image: count, packed entries, zero tail
                let body_end = BODY + 2 + PER_PAGE * ENTRY_SIZE;
                page.bytes_mut()[BODY..body_end].fill(0);
                page.write_u16(BODY, chunk.len() as u16);
                for (j, e) in chunk.iter().enumerate() {
                    let off = BODY + 2 + j * ENTRY_SIZE;
                    page.write_u64(off, e.extent.start.to_raw());
                    page.write_u32(off + 8, e.extent.size);
                    page.write_u64(off + 12, e.owner);
                }
            }
            match core.txlog.log_page_change(
                tx,
                &pinned,
                &before,
                NONE_RAW,
                SEG_SPACE,
                page_type::EXTENTS,
            )? {
                Some(lsn) => core.buffers.unpin_dirty(pinned, Affinity::Loved, lsn),
                None => core.buffers.unpin(pinned, Affinity::Loved),
            }
        }
        Ok(())
    }

    /// Binary search by `(file_id, start_page_id)`. A key below the first
    /// entry yields insertion index 0; above the last, the entry count.
    pub fn search(entries: &[SegExtent], key: (u16, u32)) -> Result<usize, usize> {
        entries.binary_search_by(|e| {
            (e.extent.start.file_id, e.extent.start.page_id).cmp(&key)
        })
    }

    /// Insert a free extent, coalescing with contiguous neighbors. Throws
    /// on any overlap.
    pub fn insert_coalescing(
        entries: &mut Vec<SegExtent>,
        extent: Extent,
    ) -> DbResult<()> {
        let key = (extent.start.file_id, extent.start.page_id);
        let idx = match Self::search(entries, key) {
            Ok(_) => {
                return Err(DbError::Storage(format!(
                    "extent at {} already present",
                    extent.start
                )))
            }
            Err(i) => i,
        };
        if idx > 0 {
            let prev = &entries[idx - 1].extent;
            if prev.start.file_id == extent.start.file_id && prev.end() > extent.start.page_id {
                return Err(DbError::Storage(format!(
                    "extent at {} overlaps lower neighbor",
                    extent.start
                )));
            }
        }
        if idx < entries.len() {
            let next = &entries[idx].extent;
            if next.start.file_id == extent.start.file_id && extent.end() > next.start.page_id {
                return Err(DbError::Storage(format!(
                    "extent at {} overlaps upper neighbor",
                    extent.start
                )));
            }
        }
        let merge_lower = idx > 0 && {
            let prev = &entries[idx - 1].extent;
            prev.start.file_id == extent.start.file_id && prev.end() == extent.start.page_id
        };
        let merge_upper = idx < entries.len() && {
            let next = &entries[idx].extent;
            next.start.file_id == extent.start.file_id && extent.end() == next.start.page_id
        };
        match (merge_lower, merge_upper) {
            (true, true) => {
                let upper_size = entries[idx].extent.size;
                entries[idx - 1].extent.size += extent.size + upper_size;
                entries.remove(idx);
            }
            (true, false) => entries[idx - 1].extent.size += extent.size,
            (false, true) => {
                entries[idx].extent.start = extent.start;
                entries[idx].extent.size += extent.size;
            }
            (false, false) => entries.insert(
                idx,
                SegExtent {
                    extent,
                    owner: NONE_RAW,
                },
            ),
        }
        Ok(())
    }

    /// Take the first extent of at least `min_size` pages, splitting a
    /// larger one and writing back the remainder with an updated page id.
    pub fn take_first_fit(entries: &mut Vec<SegExtent>, min_size: u32) -> Option<Extent> {
        let idx = entries.iter().position(|e| e.extent.size >= min_size)?;
        let found = entries[idx].extent;
        if found.size == min_size {
            entries.remove(idx);
            Some(found)
        } else {
            entries[idx].extent.start.page_id += min_size;
            entries[idx].extent.size -= min_size;
            Some(Extent::new(found.start, min_size))
        }
    }

    /// First entry matching a caller-supplied predicate.
    pub fn find_matching(
        entries: &[SegExtent],
        filter: impl Fn(&SegExtent) -> bool,
    ) -> Option<SegExtent> {
        entries.iter().copied().find(|e| filter(e))
    }

    /// Insert a used extent (no coalescing; owners differ). Overlap is an
    /// invariant violation.
    pub fn insert_owned(
        entries: &mut Vec<SegExtent>,
        extent: Extent,
        owner: u64,
    ) -> DbResult<()> {
        let key = (extent.start.file_id, extent.start.page_id);
        let idx = match Self::search(entries, key) {
            Ok(_) => {
                return Err(DbError::Storage(format!(
                    "used extent at {} already present",
                    extent.start
                )))
            }
            Err(i) => i,
        };
        entries.insert(idx, SegExtent { extent, owner });
        debug!(start = %extent.start, size = extent.size, owner, "used extent recorded");
        Ok(())
    }

    /// Remove the used extent starting exactly at `start`.
    pub fn remove_owned(
        entries: &mut Vec<SegExtent>,
        start: FilePage,
    ) -> DbResult<SegExtent> {
        match Self::search(entries, (start.file_id, start.page_id)) {
            Ok(i) => Ok(entries.remove(i)),
            Err(_) => Err(DbError::Storage(format!("no used extent at {}", start))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(p: u32) -> FilePage {
        FilePage::new(0, p)
    }

    fn free(entries: &[(u32, u32)]) -> Vec<SegExtent> {
        entries
            .iter()
            .map(|(s, n)| SegExtent {
                extent: Extent::new(fp(*s), *n),
                owner: NONE_RAW,
            })
            .collect()
    }

    #[test]
    fn test_search_boundaries() {
        let e = free(&[(10, 5), (20, 5), (30, 5)]);
        assert_eq!(ExtentTable::search(&e, (0, 5)), Err(0));
        assert_eq!(ExtentTable::search(&e, (0, 10)), Ok(0));
        assert_eq!(ExtentTable::search(&e, (0, 25)), Err(2));
        assert_eq!(ExtentTable::search(&e, (0, 99)), Err(3));
    }

    #[test]
    fn test_coalesce_both_sides() {
        let mut e = free(&[(10, 5), (20, 5)]);
        ExtentTable::insert_coalescing(&mut e, Extent::new(fp(15), 5)).unwrap();
        assert_eq!(e.len(), 1);
        assert_eq!(e[0].extent, Extent::new(fp(10), 15));
    }

    #[test]
    fn test_coalesce_lower_only() {
        let mut e = free(&[(10, 5)]);
        ExtentTable::insert_coalescing(&mut e, Extent::new(fp(15), 3)).unwrap();
        assert_eq!(e, free(&[(10, 8)]));
    }

    #[test]
    fn test_coalesce_upper_only() {
        let mut e = free(&[(20, 5)]);
        ExtentTable::insert_coalescing(&mut e, Extent::new(fp(17), 3)).unwrap();
        assert_eq!(e, free(&[(17, 8)]));
    }

    #[test]
    fn test_overlap_rejected() {
        let mut e = free(&[(10, 5)]);
        assert!(ExtentTable::insert_coalescing(&mut e, Extent::new(fp(12), 2)).is_err());
        assert!(ExtentTable::insert_coalescing(&mut e, Extent::new(fp(8), 4)).is_err());
        assert!(ExtentTable::insert_coalescing(&mut e, Extent::new(fp(10), 5)).is_err());
    }

    #[test]
    fn test_no_coalesce_across_files() {
        let mut e = vec![SegExtent {
            extent: Extent::new(FilePage::new(1, 10), 5),
            owner: NONE_RAW,
        }];
        ExtentTable::insert_coalescing(&mut e, Extent::new(FilePage::new(0, 15), 5)).unwrap();
        assert_eq!(e.len(), 2);
    }

    #[test]
    fn test_take_first_fit_splits() {
        let mut e = free(&[(10, 2), (20, 10)]);
        let got = ExtentTable::take_first_fit(&mut e, 4).unwrap();
        assert_eq!(got, Extent::new(fp(20), 4));
        assert_eq!(e[1].extent, Extent::new(fp(24), 6));
        // exact fit removes the entry
        let got = ExtentTable::take_first_fit(&mut e, 2).unwrap();
        assert_eq!(got, Extent::new(fp(10), 2));
        assert_eq!(e.len(), 1);
        assert!(ExtentTable::take_first_fit(&mut e, 100).is_none());
    }

    #[test]
    fn test_owned_roundtrip() {
        let mut e = Vec::new();
        ExtentTable::insert_owned(&mut e, Extent::new(fp(10), 4), 7).unwrap();
        ExtentTable::insert_owned(&mut e, Extent::new(fp(30), 4), 9).unwrap();
        assert!(ExtentTable::insert_owned(&mut e, Extent::new(fp(10), 4), 9).is_err());
        let got = ExtentTable::remove_owned(&mut e, fp(10)).unwrap();
        assert_eq!(got.owner, 7);
        assert!(ExtentTable::remove_owned(&mut e, fp(10)).is_err());
    }
}
