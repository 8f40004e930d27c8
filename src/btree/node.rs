use crate::common::{DbError, DbResult};
use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::log::Lsn;
use crate::storage::page::page_type;
use crate::storage::{DirArea, FilePage, Page, Rowid};

pub use crate::dataset::row_page::flags;

const PREV: usize = PAGE_HEADER_SIZE;
const NEXT: usize = PAGE_HEADER_SIZE + 8;
const LEVEL: usize = PAGE_HEADER_SIZE + 16;
const DIR_BASE: usize = PAGE_HEADER_SIZE + 18;

/// Overhead of a serialized leaf entry beyond its key bytes.
pub const LEAF_ENTRY_OVERHEAD: usize = 1 + 8 + 8 + 2 + 10;
pub const BRANCH_ENTRY_OVERHEAD: usize = 2 + 8;

/// An index entry on a leaf: row-header flags and lock holder embedded so
/// MVCC applies uniformly, plus the undo address of the last operation on
/// the entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafEntry {
    pub flags: u8,
    pub holder: u64,
    pub undo: Lsn,
    pub key: Vec<u8>,
    pub rowid: Rowid,
}

impl LeafEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LEAF_ENTRY_OVERHEAD + self.key.len());
        buf.push(self.flags);
        buf.extend(&self.holder.to_le_bytes());
        buf.extend(&self.undo.to_le_bytes());
        buf.extend(&(self.key.len() as u16).to_le_bytes());
        buf.extend(&self.key);
        buf.extend(&self.rowid.to_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> DbResult<Self> {
        if buf.len() < LEAF_ENTRY_OVERHEAD {
            return Err(DbError::Storage("short leaf entry".to_string()));
        }
        let flags = buf[0];
        let holder = u64::from_le_bytes(buf[1..9].try_into().unwrap());
        let undo = u64::from_le_bytes(buf[9..17].try_into().unwrap());
        let klen = u16::from_le_bytes(buf[17..19].try_into().unwrap()) as usize;
        let key = buf[19..19 + klen].to_vec();
        let rowid = Rowid::from_bytes(&buf[19 + klen..19 + klen + 10]);
        Ok(LeafEntry {
            flags,
            holder,
            undo,
            key,
            rowid,
        })
    }

    /// Byte offset of the undo field within a serialized entry.
    pub const UNDO_OFFSET: usize = 9;
}

/// A branch entry: separator key and child page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchEntry {
    pub key: Vec<u8>,
    pub child: FilePage,
}

impl BranchEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BRANCH_ENTRY_OVERHEAD + self.key.len());
        buf.extend(&(self.key.len() as u16).to_le_bytes());
        buf.extend(&self.key);
        buf.extend(&self.child.to_raw().to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> DbResult<Self> {
        if buf.len() < BRANCH_ENTRY_OVERHEAD {
            return Err(DbError::Storage("short branch entry".to_string()));
        }
        let klen = u16::from_le_bytes(buf[..2].try_into().unwrap()) as usize;
        let key = buf[2..2 + klen].to_vec();
        let raw = u64::from_le_bytes(buf[2 + klen..2 + klen + 8].try_into().unwrap());
        Ok(BranchEntry {
            key,
            child: FilePage::from_raw(raw)
                .ok_or_else(|| DbError::Storage("branch entry without child".to_string()))?,
        })
    }
}

/// Static layout helpers for tree node pages. Slot 0 of the directory is
/// the node's bounding predicate; entries occupy slots 1..count.
pub struct TreeNode;

impl TreeNode {
    pub fn dir() -> DirArea {
        DirArea::new(DIR_BASE, PAGE_SIZE)
    }

    pub fn init(page: &mut Page, segment_type: u8, level: u16, predicate: &[u8]) {
        page.set_segment_type(segment_type);
        page.set_page_type(if level == 0 {
            page_type::TREE_LEAF
        } else {
            page_type::TREE_BRANCH
        });
        page.write_u64(PREV, crate::storage::page::NONE_RAW);
        page.write_u64(NEXT, crate::storage::page::NONE_RAW);
        page.write_u16(LEVEL, level);
        page.write_u16(DIR_BASE, 0);
        Self::dir().push_row(page, predicate);
    }

    pub fn level(page: &Page) -> u16 {
        page.read_u16(LEVEL)
    }
    pub fn is_leaf(page: &Page) -> bool {
        Self::level(page) == 0
    }
    pub fn prev_page(page: &Page) -> Option<FilePage> {
        FilePage::from_raw(page.read_u64(PREV))
    }
    pub fn set_prev_page(page: &mut Page, p: Option<FilePage>) {
        page.write_u64(PREV, FilePage::raw_of(p));
    }
    pub fn next_page(page: &Page) -> Option<FilePage> {
        FilePage::from_raw(page.read_u64(NEXT))
    }
    pub fn set_next_page(page: &mut Page, p: Option<FilePage>) {
        page.write_u64(NEXT, FilePage::raw_of(p));
    }

    /// Number of entries, excluding the bounding predicate at slot 0.
    pub fn entry_count(page: &Page) -> usize {
        Self::dir().count(page).saturating_sub(1)
    }

    pub fn predicate(page: &Page) -> &[u8] {
        Self::dir().row(page, 0)
    }

    pub fn set_predicate(page: &mut Page, key: &[u8]) {
        Self::dir().replace_row(page, 0, key);
    }

    pub fn leaf_entry(page: &Page, idx: usize) -> DbResult<LeafEntry> {
        LeafEntry::from_bytes(Self::dir().row(page, idx))
    }

    pub fn branch_entry(page: &Page, idx: usize) -> DbResult<BranchEntry> {
        BranchEntry::from_bytes(Self::dir().row(page, idx))
    }

    /// Raw key bytes of the entry at `idx` (leaf or branch).
    pub fn entry_key(page: &Page, idx: usize) -> DbResult<Vec<u8>> {
        if Self::is_leaf(page) {
            Ok(Self::leaf_entry(page, idx)?.key)
        } else {
            Ok(Self::branch_entry(page, idx)?.key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_entry_roundtrip() {
        let e = LeafEntry {
            flags: flags::LOCKED,
            holder: 9,
            undo: 1234,
            key: b"carrot".to_vec(),
            rowid: Rowid::new(FilePage::new(0, 40), 3),
        };
        let b = e.to_bytes();
        assert_eq!(LeafEntry::from_bytes(&b).unwrap(), e);
        // the undo field sits at a fixed offset so redo can patch it
        let undo = u64::from_le_bytes(
            b[LeafEntry::UNDO_OFFSET..LeafEntry::UNDO_OFFSET + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(undo, 1234);
    }

    #[test]
    fn test_branch_entry_roundtrip() {
        let e = BranchEntry {
            key: b"m".to_vec(),
            child: FilePage::new(0, 77),
        };
        assert_eq!(BranchEntry::from_bytes(&e.to_bytes()).unwrap(), e);
    }

    #[test]
    fn test_node_init_has_predicate() {
        let mut p = Page::new();
        TreeNode::init(&mut p, 4, 0, b"");
        assert!(TreeNode::is_leaf(&p));
        assert_eq!(TreeNode::entry_count(&p), 0);
        assert_eq!(TreeNode::predicate(&p), b"");
        TreeNode::set_predicate(&mut p, b"alpha");
        assert_eq!(TreeNode::predicate(&p), b"alpha");
        assert_eq!(TreeNode::next_page(&p), None);
    }
}
