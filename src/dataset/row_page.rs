use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::storage::page::{page_type, NONE_RAW};
use crate::storage::{DirArea, FilePage, Page};

/// Row header flags.
pub mod flags {
    pub const DELETED: u8 = 1;
    pub const LOCKED: u8 = 2;
    /// Reserved for a future overflow chain; the 8-byte field then holds a
    /// continuation rowid instead of a lock holder.
    pub const LINKED: u8 = 4;
    pub const REPLACE: u8 = 8;
}

/// Bytes of row header before the payload: flags(1) + holder/continuation(8).
pub const ROW_OVERHEAD: usize = 9;

const NEXT: usize = PAGE_HEADER_SIZE;
const PREV: usize = PAGE_HEADER_SIZE + 8;
const NEXT_FREE: usize = PAGE_HEADER_SIZE + 16;
const DELETE_COUNT: usize = PAGE_HEADER_SIZE + 24;
const ON_FREE_LIST: usize = PAGE_HEADER_SIZE + 26;
const DIR_BASE: usize = PAGE_HEADER_SIZE + 27;

/// Static layout helpers for dataset row pages: chain links, the free-list
/// membership, and the directory area of row slots.
pub struct RowPage;

impl RowPage {
    pub fn dir() -> DirArea {
        DirArea::new(DIR_BASE, PAGE_SIZE)
    }

    /// Bytes a row page can devote to slots and row bytes.
    pub fn usable() -> usize {
        PAGE_SIZE - DIR_BASE - 2
    }

    pub fn init(page: &mut Page, segment_type: u8) {
        page.set_segment_type(segment_type);
        page.set_page_type(page_type::ROW);
        page.write_u64(NEXT, NONE_RAW);
        page.write_u64(PREV, NONE_RAW);
        page.write_u64(NEXT_FREE, NONE_RAW);
        page.write_u16(DELETE_COUNT, 0);
        page.bytes_mut()[ON_FREE_LIST] = 0;
        page.write_u16(DIR_BASE, 0);
    }

    pub fn next_page(page: &Page) -> Option<FilePage> {
        FilePage::from_raw(page.read_u64(NEXT))
    }
    pub fn set_next_page(page: &mut Page, p: Option<FilePage>) {
        page.write_u64(NEXT, FilePage::raw_of(p));
    }
    pub fn prev_page(page: &Page) -> Option<FilePage> {
        FilePage::from_raw(page.read_u64(PREV))
    }
    pub fn set_prev_page(page: &mut Page, p: Option<FilePage>) {
        page.write_u64(PREV, FilePage::raw_of(p));
    }
    pub fn next_free_page(page: &Page) -> Option<FilePage> {
        FilePage::from_raw(page.read_u64(NEXT_FREE))
    }
    pub fn set_next_free_page(page: &mut Page, p: Option<FilePage>) {
        page.write_u64(NEXT_FREE, FilePage::raw_of(p));
    }
    pub fn on_free_list(page: &Page) -> bool {
        page.bytes()[ON_FREE_LIST] != 0
    }
    pub fn set_on_free_list(page: &mut Page, v: bool) {
        page.bytes_mut()[ON_FREE_LIST] = v as u8;
    }
    pub fn delete_count(page: &Page) -> u16 {
        page.read_u16(DELETE_COUNT)
    }
    pub fn set_delete_count(page: &mut Page, v: u16) {
        page.write_u16(DELETE_COUNT, v);
    }

    pub fn row_flags(page: &Page, slot: usize) -> u8 {
        Self::dir().row(page, slot)[0]
    }
    pub fn set_row_flags(page: &mut Page, slot: usize, f: u8) {
        Self::dir().row_mut(page, slot)[0] = f;
    }
    pub fn row_holder(page: &Page, slot: usize) -> u64 {
        u64::from_le_bytes(Self::dir().row(page, slot)[1..9].try_into().unwrap())
    }
    pub fn set_row_holder(page: &mut Page, slot: usize, holder: u64) {
        Self::dir().row_mut(page, slot)[1..9].copy_from_slice(&holder.to_le_bytes());
    }
    pub fn row_payload(page: &Page, slot: usize) -> &[u8] {
        &Self::dir().row(page, slot)[ROW_OVERHEAD..]
    }

    pub fn build_row(flags: u8, holder: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ROW_OVERHEAD + payload.len());
        buf.push(flags);
        buf.extend(&holder.to_le_bytes());
        buf.extend(payload);
        buf
    }

    /// Load factor in percent: how much of the usable area holds slots and
    /// live row bytes.
    pub fn load_percent(page: &Page) -> usize {
        let free = Self::dir().free_bytes(page);
        100 - free * 100 / Self::usable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_and_links() {
        let mut p = Page::new();
        RowPage::init(&mut p, 3);
        assert_eq!(p.page_type(), page_type::ROW);
        assert_eq!(RowPage::next_page(&p), None);
        RowPage::set_next_page(&mut p, Some(FilePage::new(0, 5)));
        assert_eq!(RowPage::next_page(&p), Some(FilePage::new(0, 5)));
        assert!(!RowPage::on_free_list(&p));
        RowPage::set_on_free_list(&mut p, true);
        assert!(RowPage::on_free_list(&p));
    }

    #[test]
    fn test_row_header_accessors() {
        let mut p = Page::new();
        RowPage::init(&mut p, 3);
        let row = RowPage::build_row(flags::LOCKED, 42, b"payload");
        RowPage::dir().push_row(&mut p, &row);
        assert_eq!(RowPage::row_flags(&p, 0), flags::LOCKED);
        assert_eq!(RowPage::row_holder(&p, 0), 42);
        assert_eq!(RowPage::row_payload(&p, 0), b"payload");
        RowPage::set_row_flags(&mut p, 0, flags::DELETED | flags::LOCKED);
        RowPage::set_row_holder(&mut p, 0, 7);
        assert_eq!(RowPage::row_flags(&p, 0), flags::DELETED | flags::LOCKED);
        assert_eq!(RowPage::row_holder(&p, 0), 7);
    }

    #[test]
    fn test_load_percent_rises() {
        let mut p = Page::new();
        RowPage::init(&mut p, 3);
        let empty = RowPage::load_percent(&p);
        for _ in 0..10 {
            let row = RowPage::build_row(0, 0, &[0u8; 512]);
            RowPage::dir().push_row(&mut p, &row);
        }
        assert!(RowPage::load_percent(&p) > empty + 50);
    }
}
