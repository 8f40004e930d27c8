use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::buffer::{Affinity, LatchMode};
use crate::common::{DbError, DbResult};
use crate::config::{
    PAGE_HEADER_SIZE, PAGE_SIZE, SEGMENT_CATALOG_PAGE, SEGMENT_GROWTH_PERCENT,
    SEGMENT_INITIAL_SIZE, SEGMENT_NEXT_SIZE, SYS_FILE_ID,
};
use crate::core::Core;
use crate::log::record::tag;
use crate::log::{LogRecord, RecordKind};
use crate::space::extents::Extent;
use crate::storage::page::{page_type, NONE_RAW};
use crate::storage::{DirArea, FilePage, Page};
use crate::tx::pool::Transaction;

/// Registered segment type bytes. User-extensible types get higher codes.
pub const SEG_SPACE: u8 = 1;
pub const SEG_CATALOG: u8 = 2;
pub const SEG_DATASET: u8 = 3;
pub const SEG_TREE: u8 = 4;

/// Uniform callbacks every segment type provides. Redo is physical (the
/// record names its page). Undo comes in two shapes: the transactional one
/// re-finds the target, applies the inverse and writes a CLR, while
/// `undo_into` applies the inverse into a page buffer for version
/// reconstruction without logging anything.
pub trait SegmentMethod: Send + Sync {
    fn segment_type(&self) -> u8;
    fn name(&self) -> &'static str;
    fn create(&self, core: &Core, seg: &Segment, tx: &Arc<Transaction>) -> DbResult<()>;
    fn drop_segment(&self, core: &Core, seg: &Segment, tx: &Arc<Transaction>) -> DbResult<()>;
    fn redo(&self, page: &mut Page, rec: &LogRecord) -> DbResult<()>;
    fn undo(&self, core: &Core, rec: &LogRecord, tx: &Arc<Transaction>) -> DbResult<()>;
    fn undo_into(&self, rec: &LogRecord, page: &mut Page) -> DbResult<()>;
    fn did_allocate_page(
        &self,
        _core: &Core,
        _seg: &Segment,
        _page: FilePage,
        _tx: &Arc<Transaction>,
    ) -> DbResult<()> {
        Ok(())
    }
}

/// Maps segment type bytes to method instances. The byte-to-name table is
/// persisted in the system key so restart can reconstruct the mapping.
pub struct SegmentFactory {
    methods: RwLock<HashMap<u8, Arc<dyn SegmentMethod>>>,
}

impl SegmentFactory {
    pub fn new() -> Self {
        SegmentFactory {
            methods: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, method: Arc<dyn SegmentMethod>) {
        self.methods
            .write()
            .unwrap()
            .insert(method.segment_type(), method);
    }

    pub fn method(&self, segment_type: u8) -> DbResult<Arc<dyn SegmentMethod>> {
        self.methods
            .read()
            .unwrap()
            .get(&segment_type)
            .cloned()
            .ok_or_else(|| {
                DbError::Storage(format!("no method for segment type {}", segment_type))
            })
    }

    pub fn registry(&self) -> Vec<(u8, String)> {
        let mut out: Vec<(u8, String)> = self
            .methods
            .read()
            .unwrap()
            .values()
            .map(|m| (m.segment_type(), m.name().to_string()))
            .collect();
        out.sort_unstable();
        out
    }
}

impl Default for SegmentFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Physical record application shared by every method: the byte range a
/// mutation changed, with both images.
pub mod physical {
    use super::*;

    pub fn is_physical(rec: &LogRecord) -> bool {
        rec.chunk(tag::OFFSET).is_some()
    }

    pub fn redo(page: &mut Page, rec: &LogRecord) -> DbResult<()> {
        let off = rec
            .chunk_u16(tag::OFFSET)
            .ok_or_else(|| DbError::Redo("physical record missing offset".to_string()))?
            as usize;
        let new = rec.require(tag::NEW)?;
        page.bytes_mut()[off..off + new.len()].copy_from_slice(new);
        Ok(())
    }

    pub fn undo(core: &Core, rec: &LogRecord, tx: &Arc<Transaction>) -> DbResult<()> {
        let id = FilePage::from_raw(rec.page)
            .ok_or_else(|| DbError::Rollback("physical undo without a page".to_string()))?;
        let pinned = core.buffers.pin(id, LatchMode::Exclusive)?;
        let off = rec.chunk_u16(tag::OFFSET).unwrap_or(0) as usize;
        let old = rec.require(tag::OLD)?.to_vec();
        {
            let mut page = pinned.page_mut();
            page.bytes_mut()[off..off + old.len()].copy_from_slice(&old);
            page.set_undo_next_lsn(rec.page_prev_undo);
        }
        let mut clr = LogRecord::new(RecordKind::Clr);
        clr.undo_next = rec.undo_next;
        clr.page_prev_undo = rec.page_prev_undo;
        clr.segment_id = rec.segment_id;
        clr.page = rec.page;
        clr.segment_type = rec.segment_type;
        clr.page_type = rec.page_type;
        clr.push_u16(tag::OFFSET, off as u16);
        clr.push(tag::NEW, old);
        let lsn = core.txlog.append_clr(tx, Some(&pinned), clr)?;
        core.buffers.unpin_dirty(pinned, Affinity::Liked, lsn);
        Ok(())
    }

    pub fn undo_into(rec: &LogRecord, page: &mut Page) -> DbResult<()> {
        let off = rec
            .chunk_u16(tag::OFFSET)
            .ok_or_else(|| DbError::Storage("physical record missing offset".to_string()))?
            as usize;
        let old = rec.require(tag::OLD)?;
        page.bytes_mut()[off..off + old.len()].copy_from_slice(old);
        Ok(())
    }
}

/// The extent tables' segment method: all records are physical.
pub struct SpaceMethod;

impl SegmentMethod for SpaceMethod {
    fn segment_type(&self) -> u8 {
        SEG_SPACE
    }
    fn name(&self) -> &'static str {
        "space"
    }
    fn create(&self, _core: &Core, _seg: &Segment, _tx: &Arc<Transaction>) -> DbResult<()> {
        Err(DbError::Storage("space segments are fixed".to_string()))
    }
    fn drop_segment(&self, _core: &Core, _seg: &Segment, _tx: &Arc<Transaction>) -> DbResult<()> {
        Err(DbError::Storage("space segments are fixed".to_string()))
    }
    fn redo(&self, page: &mut Page, rec: &LogRecord) -> DbResult<()> {
        physical::redo(page, rec)
    }
    fn undo(&self, core: &Core, rec: &LogRecord, tx: &Arc<Transaction>) -> DbResult<()> {
        physical::undo(core, rec, tx)
    }
    fn undo_into(&self, rec: &LogRecord, page: &mut Page) -> DbResult<()> {
        physical::undo_into(rec, page)
    }
}

/// The segment catalog's own method: physical records over the catalog page.
pub struct CatalogMethod;

impl SegmentMethod for CatalogMethod {
    fn segment_type(&self) -> u8 {
        SEG_CATALOG
    }
    fn name(&self) -> &'static str {
        "catalog"
    }
    fn create(&self, _core: &Core, _seg: &Segment, _tx: &Arc<Transaction>) -> DbResult<()> {
        Err(DbError::Storage("the catalog segment is fixed".to_string()))
    }
    fn drop_segment(&self, _core: &Core, _seg: &Segment, _tx: &Arc<Transaction>) -> DbResult<()> {
        Err(DbError::Storage("the catalog segment is fixed".to_string()))
    }
    fn redo(&self, page: &mut Page, rec: &LogRecord) -> DbResult<()> {
        physical::redo(page, rec)
    }
    fn undo(&self, core: &Core, rec: &LogRecord, tx: &Arc<Transaction>) -> DbResult<()> {
        physical::undo(core, rec, tx)
    }
    fn undo_into(&self, rec: &LogRecord, page: &mut Page) -> DbResult<()> {
        physical::undo_into(rec, page)
    }
}

/// A segment descriptor as stored in the catalog page. The segment id is
/// the first page of its first extent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub segment_id: FilePage,
    pub segment_type: u8,
    /// The segment's anchor page: tree root, or head of a dataset's page
    /// chain.
    pub data_root: Option<FilePage>,
    pub new_extent: Option<Extent>,
    /// Next unused page index within `new_extent`.
    pub next_page: u32,
    pub initial_size: u32,
    pub next_size: u32,
    pub growth_rate: u32,
    pub page_count: u32,
    /// Head of the segment's free-page list.
    pub free_page: Option<FilePage>,
}

const REC_SIZE: usize = 57;

impl Segment {
    pub fn new(segment_id: FilePage, segment_type: u8, extent: Extent) -> Self {
        Segment {
            segment_id,
            segment_type,
            data_root: None,
            new_extent: Some(extent),
            next_page: 0,
            initial_size: SEGMENT_INITIAL_SIZE,
            next_size: SEGMENT_NEXT_SIZE,
            growth_rate: SEGMENT_GROWTH_PERCENT,
            page_count: 0,
            free_page: None,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REC_SIZE);
        buf.extend(&self.segment_id.to_raw().to_le_bytes());
        buf.push(self.segment_type);
        buf.extend(&FilePage::raw_of(self.data_root).to_le_bytes());
        let (ext_raw, ext_size) = match self.new_extent {
            Some(e) => (e.start.to_raw(), e.size),
            None => (NONE_RAW, 0),
        };
        buf.extend(&ext_raw.to_le_bytes());
        buf.extend(&ext_size.to_le_bytes());
        buf.extend(&self.next_page.to_le_bytes());
        buf.extend(&self.initial_size.to_le_bytes());
        buf.extend(&self.next_size.to_le_bytes());
        buf.extend(&self.growth_rate.to_le_bytes());
        buf.extend(&self.page_count.to_le_bytes());
        buf.extend(&FilePage::raw_of(self.free_page).to_le_bytes());
        debug_assert_eq!(buf.len(), REC_SIZE);
        buf
    }

    fn from_bytes(buf: &[u8]) -> DbResult<Self> {
        if buf.len() < REC_SIZE {
            return Err(DbError::Storage("short segment record".to_string()));
        }
        let u64_at = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        let segment_id = FilePage::from_raw(u64_at(0))
            .ok_or_else(|| DbError::Storage("segment record without id".to_string()))?;
        let ext_raw = u64_at(17);
        let ext_size = u32_at(25);
        Ok(Segment {
            segment_id,
            segment_type: buf[8],
            data_root: FilePage::from_raw(u64_at(9)),
            new_extent: FilePage::from_raw(ext_raw).map(|s| Extent::new(s, ext_size)),
            next_page: u32_at(29),
            initial_size: u32_at(33),
            next_size: u32_at(37),
            growth_rate: u32_at(41),
            page_count: u32_at(45),
            free_page: FilePage::from_raw(u64_at(49)),
        })
    }
}

fn catalog_page() -> FilePage {
    FilePage::new(SYS_FILE_ID, SEGMENT_CATALOG_PAGE)
}

fn catalog_dir() -> DirArea {
    DirArea::new(PAGE_HEADER_SIZE, PAGE_SIZE)
}

fn catalog_index(page: &Page, segment_id: FilePage) -> Result<usize, usize> {
    let dir = catalog_dir();
    let n = dir.count(page);
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let raw = u64::from_le_bytes(dir.row(page, mid)[..8].try_into().unwrap());
        match raw.cmp(&segment_id.to_raw()) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

pub fn catalog_lookup(core: &Core, segment_id: FilePage) -> DbResult<Option<Segment>> {
    let pinned = core.buffers.pin(catalog_page(), LatchMode::Shared)?;
    let res = {
        let page = pinned.page();
        match catalog_index(&page, segment_id) {
            Ok(i) => Some(Segment::from_bytes(catalog_dir().row(&page, i))?),
            Err(_) => None,
        }
    };
    core.buffers.unpin(pinned, Affinity::Loved);
    Ok(res)
}

pub fn catalog_list(core: &Core) -> DbResult<Vec<Segment>> {
    let pinned = core.buffers.pin(catalog_page(), LatchMode::Shared)?;
    let mut out = Vec::new();
    {
        let page = pinned.page();
        let dir = catalog_dir();
        for i in 0..dir.count(&page) {
            out.push(Segment::from_bytes(dir.row(&page, i))?);
        }
    }
    core.buffers.unpin(pinned, Affinity::Loved);
    Ok(out)
}

/// Insert or replace the catalog record, with physical logging.
pub fn catalog_put(core: &Core, tx: &Arc<Transaction>, seg: &Segment) -> DbResult<()> {
    let pinned = core.buffers.pin(catalog_page(), LatchMode::Exclusive)?;
    let before = pinned.page().clone();
    {
        let mut page = pinned.page_mut();
        page.set_segment_type(SEG_CATALOG);
        page.set_page_type(page_type::CATALOG);
        let dir = catalog_dir();
        let bytes = seg.to_bytes();
        match catalog_index(&page, seg.segment_id) {
            Ok(i) => dir.replace_row(&mut page, i, &bytes),
            Err(i) => {
                if !dir.fits(&page, bytes.len()) {
                    return Err(DbError::OutOfSpace("segment catalog full".to_string()));
                }
                dir.insert_row_at(&mut page, i, &bytes);
            }
        }
    }
    let lsn = core.txlog.log_page_change(
        tx,
        &pinned,
        &before,
        seg.segment_id.to_raw(),
        SEG_CATALOG,
        page_type::CATALOG,
    )?;
    match lsn {
        Some(l) => core.buffers.unpin_dirty(pinned, Affinity::Loved, l),
        None => core.buffers.unpin(pinned, Affinity::Loved),
    }
    Ok(())
}

pub fn catalog_remove(core: &Core, tx: &Arc<Transaction>, segment_id: FilePage) -> DbResult<()> {
    let pinned = core.buffers.pin(catalog_page(), LatchMode::Exclusive)?;
    let before = pinned.page().clone();
    {
        let mut page = pinned.page_mut();
        match catalog_index(&page, segment_id) {
            Ok(i) => catalog_dir().remove_row_at(&mut page, i),
            Err(_) => {
                return Err(DbError::Storage(format!(
                    "segment {} not in catalog",
                    segment_id
                )))
            }
        }
    }
    let lsn = core.txlog.log_page_change(
        tx,
        &pinned,
        &before,
        segment_id.to_raw(),
        SEG_CATALOG,
        page_type::CATALOG,
    )?;
    match lsn {
        Some(l) => core.buffers.unpin_dirty(pinned, Affinity::Loved, l),
        None => core.buffers.unpin(pinned, Affinity::Loved),
    }
    Ok(())
}

/// Create a segment of the given type: first extent, catalog registration
/// and the method's own initialization, atomically.
pub fn create_segment(core: &Core, tx: &Arc<Transaction>, segment_type: u8) -> DbResult<Segment> {
    let method = core.factory.method(segment_type)?;
    let nta = core.txlog.begin_nested(tx);
    let res = (|| {
        let size = SEGMENT_INITIAL_SIZE.max(SEGMENT_NEXT_SIZE);
        let extent = core.space.allocate_extent(core, tx, NONE_RAW, size)?;
        let seg = Segment::new(extent.start, segment_type, extent);
        catalog_put(core, tx, &seg)?;
        method.create(core, &seg, tx)?;
        catalog_lookup(core, seg.segment_id)?
            .ok_or_else(|| DbError::Storage("segment vanished during create".to_string()))
    })();
    match res {
        Ok(seg) => {
            core.txlog.commit_nested(tx, nta)?;
            debug!(segment = %seg.segment_id, segment_type, "segment created");
            Ok(seg)
        }
        Err(e) => {
            core.txlog.rollback_nested(tx, nta, core)?;
            Err(e)
        }
    }
}

/// Drop a segment: the method's teardown, then every extent back to the
/// free table, then the catalog record, atomically.
pub fn drop_segment(core: &Core, tx: &Arc<Transaction>, segment_id: FilePage) -> DbResult<()> {
    let seg = catalog_lookup(core, segment_id)?
        .ok_or_else(|| DbError::Storage(format!("segment {} not found", segment_id)))?;
    let method = core.factory.method(seg.segment_type)?;
    let nta = core.txlog.begin_nested(tx);
    let res = (|| {
        method.drop_segment(core, &seg, tx)?;
        core.space.release_owner(core, tx, segment_id.to_raw())?;
        catalog_remove(core, tx, segment_id)
    })();
    match res {
        Ok(()) => core.txlog.commit_nested(tx, nta),
        Err(e) => {
            core.txlog.rollback_nested(tx, nta, core)?;
            Err(e)
        }
    }
}

/// Allocate one page for a segment: its free-page list first, then the
/// current extent, then a fresh extent on the growth schedule.
pub fn allocate_page(core: &Core, tx: &Arc<Transaction>, segment_id: FilePage) -> DbResult<FilePage> {
    let mut seg = catalog_lookup(core, segment_id)?
        .ok_or_else(|| DbError::Storage(format!("segment {} not found", segment_id)))?;
    let method = core.factory.method(seg.segment_type)?;
    if let Some(page) = seg.free_page {
        let next = {
            let pinned = core.buffers.pin(page, LatchMode::Shared)?;
            let raw = pinned.page().read_u64(PAGE_HEADER_SIZE);
            core.buffers.unpin(pinned, Affinity::Hated);
            FilePage::from_raw(raw)
        };
        seg.free_page = next;
        seg.page_count += 1;
        catalog_put(core, tx, &seg)?;
        method.did_allocate_page(core, &seg, page, tx)?;
        return Ok(page);
    }
    if let Some(ext) = seg.new_extent {
        if seg.next_page < ext.size {
            let page = FilePage::new(ext.start.file_id, ext.start.page_id + seg.next_page);
            seg.next_page += 1;
            seg.page_count += 1;
            catalog_put(core, tx, &seg)?;
            method.did_allocate_page(core, &seg, page, tx)?;
            return Ok(page);
        }
    }
    let size = if seg.page_count == 0 {
        seg.initial_size.max(seg.next_size)
    } else {
        (seg.next_size * seg.growth_rate / 100).max(1)
    };
    let extent = core.space.allocate_extent(core, tx, segment_id.to_raw(), size)?;
    let page = extent.start;
    seg.new_extent = Some(extent);
    seg.next_page = 1;
    seg.next_size = size;
    seg.page_count += 1;
    catalog_put(core, tx, &seg)?;
    method.did_allocate_page(core, &seg, page, tx)?;
    Ok(page)
}

/// Push a page onto the segment's free-page list.
pub fn free_page_push(
    core: &Core,
    tx: &Arc<Transaction>,
    segment_id: FilePage,
    page_id: FilePage,
) -> DbResult<()> {
    let mut seg = catalog_lookup(core, segment_id)?
        .ok_or_else(|| DbError::Storage(format!("segment {} not found", segment_id)))?;
    let pinned = core.buffers.pin(page_id, LatchMode::Exclusive)?;
    let before = pinned.page().clone();
    {
        let mut page = pinned.page_mut();
        page.set_page_type(page_type::FREE);
        page.write_u64(PAGE_HEADER_SIZE, FilePage::raw_of(seg.free_page));
    }
    let lsn = core.txlog.log_page_change(
        tx,
        &pinned,
        &before,
        segment_id.to_raw(),
        seg.segment_type,
        page_type::FREE,
    )?;
    match lsn {
        Some(l) => core.buffers.unpin_dirty(pinned, Affinity::Hated, l),
        None => core.buffers.unpin(pinned, Affinity::Hated),
    }
    seg.free_page = Some(page_id);
    seg.page_count = seg.page_count.saturating_sub(1);
    catalog_put(core, tx, &seg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_record_roundtrip() {
        let mut seg = Segment::new(
            FilePage::new(0, 40),
            SEG_TREE,
            Extent::new(FilePage::new(0, 40), 4),
        );
        seg.data_root = Some(FilePage::new(0, 41));
        seg.next_page = 2;
        seg.page_count = 2;
        seg.free_page = None;
        let back = Segment::from_bytes(&seg.to_bytes()).unwrap();
        assert_eq!(back, seg);
    }

    #[test]
    fn test_segment_record_none_fields() {
        let mut seg = Segment::new(
            FilePage::new(0, 10),
            SEG_DATASET,
            Extent::new(FilePage::new(0, 10), 4),
        );
        seg.new_extent = None;
        let back = Segment::from_bytes(&seg.to_bytes()).unwrap();
        assert_eq!(back.new_extent, None);
        assert_eq!(back.data_root, None);
    }

    #[test]
    fn test_factory_registry_is_sorted() {
        let f = SegmentFactory::new();
        f.register(Arc::new(CatalogMethod));
        f.register(Arc::new(SpaceMethod));
        let reg = f.registry();
        assert_eq!(reg[0].0, SEG_SPACE);
        assert_eq!(reg[1].0, SEG_CATALOG);
        assert!(f.method(SEG_TREE).is_err());
    }
}
