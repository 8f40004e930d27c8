pub mod config;
pub mod common;
pub mod storage;
pub mod log;
pub mod buffer;
pub mod tx;
pub mod checkpoint;
pub mod recovery;
pub mod space;
pub mod segment;
pub mod sys;
pub mod dataset;
pub mod btree;
pub mod core;

use std::fs;
use std::path;

use tracing_subscriber::prelude::*;

pub use crate::common::{DbError, DbResult};
pub use crate::core::{Core, Db, Options};
pub use crate::dataset::{Dataset, DatasetScan, RowFilter};
pub use crate::btree::{BTree, Cursor, EntryFilter, KeyComparator, Predicate};
pub use crate::storage::{FilePage, Rowid};
pub use crate::tx::pool::Transaction;

/// Install the stdout + rolling-file tracing pipeline. Call once from the
/// embedding process before opening a database.
pub fn init_log() {
    let log_dir = path::Path::new(config::LOG_PATH).parent().unwrap();
    let log_filename = path::Path::new(config::LOG_PATH)
        .file_name()
        .unwrap()
        .to_str()
        .unwrap();
    fs::create_dir_all(log_dir).unwrap();

    let stdout_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_thread_names(true)
        .with_level(true);

    let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    Box::leak(Box::new(guard));

    let file_log = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_thread_names(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config::LOG_LEVEL))
        .with(stdout_log)
        .with(file_log)
        .init();
}
