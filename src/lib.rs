//! Persistent int-to-int B-tree
//!
//! Maps `i32` keys to `i32` values in a memory-mapped page file. Meant as a
//! low-level building block under file-based caches and enumerators.
//!
//! ## Architecture
//! - Storage layer: memory-mapped paged file + lock context + header storage
//! - Index layer: page geometry, node views (interior, sorted leaf, hashed
//!   leaf), top-down splitting, tree controller and statistics

pub mod config;
pub mod index;
pub mod storage;

mod error;

pub use config::{format_version, ByteOrder, TreeConfig, DEFAULT_PAGE_SIZE};
pub use error::{Result, StorageError};

pub use index::{IntToIntBTree, NodeGeometry, TreeStatistics, TreeVars};
pub use storage::{HeaderBlock, HeaderFile, HeaderStorage, PageAddress, StorageLockContext, HEADER_LEN};
