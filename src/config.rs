//! Tuning constants for cooldb.
//! Caution: changing any on-disk constant below requires deleting old
//! database files first, or startup will reject them.

pub const _NAME: &str = "cooldb";
pub const _VERSION: &str = "0.1.0";

pub const LOG_LEVEL: &str = "info";
pub const LOG_PATH: &str = "./logs/cooldb.log";

/// On-disk format version, persisted in sys.key. Mismatch aborts startup.
pub const FORMAT_VERSION: u32 = 4;

pub const PAGE_SIZE: usize = 8 * 1024;
/// Common page header: page_lsn(8) page_first_lsn(8) page_undo_next_lsn(8)
/// segment_type(1) page_type(1), padded.
pub const PAGE_HEADER_SIZE: usize = 32;

/// Frames held by the buffer pool.
pub const BUFFER_FRAMES: usize = 256;
/// Attempts to find a free frame before BufferNotFound escalates.
pub const BUFFER_RETRIES: usize = 50;

/// Usable bytes in the circular redo log.
pub const REDO_CAPACITY: u64 = 16 * 1024 * 1024;
/// Remaining redo space below which a write forces a synchronous checkpoint.
pub const REDO_RESERVE: u64 = 512 * 1024;
/// Log growth that triggers an asynchronous checkpoint.
pub const CHECKPOINT_INTERVAL: u64 = 4 * 1024 * 1024;

/// File id of sys.db. User files get higher ids.
pub const SYS_FILE_ID: u16 = 0;
/// Initial size of sys.db in pages.
pub const SYS_FILE_PAGES: u32 = 1024;
/// Pages the extender adds are at least this multiple of the request.
pub const EXTEND_FACTOR: u32 = 3;

/// Fixed page locations inside sys.db.
pub const FREE_EXTENTS_PAGE: u32 = 1;
pub const USED_EXTENTS_PAGE: u32 = 5;
pub const EXTENT_TABLE_PAGES: u32 = 4;
pub const SEGMENT_CATALOG_PAGE: u32 = 9;
/// First allocatable page in sys.db.
pub const SYS_FIRST_FREE_PAGE: u32 = 10;

/// Default segment growth schedule.
pub const SEGMENT_INITIAL_SIZE: u32 = 4;
pub const SEGMENT_NEXT_SIZE: u32 = 4;
pub const SEGMENT_GROWTH_PERCENT: u32 = 200;

/// Row-page load factor thresholds (percent) for the free-page list.
pub const LOAD_MIN_PERCENT: usize = 40;
pub const LOAD_MAX_PERCENT: usize = 90;

/// Milliseconds a blocked lock waiter sleeps between deadlock re-checks.
pub const LOCK_WAIT_SLICE_MS: u64 = 20;
