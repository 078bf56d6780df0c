//! # Basalt Storage Engine
//! A single-node relational storage core: paged disk files, a buffer pool,
//! slotted heap files, on-disk B+-tree indexes, hierarchical locking and
//! ARIES-style write-ahead logging with crash recovery.

/// The B+-tree index implementation.
pub mod btree;
/// The buffer pool manager.
pub mod buffer_pool;
/// Paged file and log I/O.
pub mod disk_manager;
/// Crate-wide error type.
pub mod errors;
/// Failure-injection sites for tests.
pub mod failpoint;
/// The slotted-page heap record manager.
pub mod heap;
/// The lock manager for concurrency control.
pub mod lock_manager;
/// Crash recovery: analyze, redo, undo, index rebuild.
pub mod recovery;
/// LRU frame replacement policy.
pub mod replacer;
/// Per-transaction state and the transaction coordinator.
pub mod transaction;
/// Column types, values and key comparison.
pub mod types;
/// The write-ahead log manager.
pub mod wal;

/// The size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// The size of the in-memory log buffer in bytes.
pub const LOG_BUFFER_SIZE: usize = 64 * 1024;

/// A handle to an open paged file, vended by the disk manager.
pub type FileId = u32;

/// A page number within one file. Page 0 is always the file header.
pub type PageNo = u32;

/// A Log Sequence Number.
pub type Lsn = i64;

/// LSN carried by pages that were created but never logged against.
pub const INVALID_LSN: Lsn = -1;

/// A transaction identifier.
pub type TxnId = u32;

/// A page, uniquely identified across all open files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub fd: FileId,
    pub page_no: PageNo,
}

/// A record identifier: the slot a record occupies in a heap file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Rid {
    pub page_no: PageNo,
    pub slot_no: u32,
}

/// A B+-tree cursor position: a slot within a leaf page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iid {
    pub page_no: PageNo,
    pub slot_no: u32,
}

pub use buffer_pool::{BufferPoolManager, PageGuard};
pub use errors::{DbError, Result};

pub fn debug_logs_enabled() -> bool {
    std::env::var_os("BASALT_DEBUG_LOG").is_some()
}

#[macro_export]
macro_rules! basalt_debug_log {
    ($($arg:tt)*) => {
        if $crate::debug_logs_enabled() {
            println!($($arg)*);
        }
    };
}
