//! Page storage layer
//!
//! A resizable memory-mapped file split into fixed-size pages, the lock
//! context guarding page access, and the fixed header block the tree
//! persists its variables into.

pub mod header;
pub mod lock;
pub mod paged_file;

pub use header::{HeaderBlock, HeaderFile, HeaderStorage, HEADER_LEN};
pub use lock::{StorageGuard, StorageLockContext};
pub use paged_file::{PageBytes, PageMut, PageRef, PagedFile};

use std::fmt;

/// Byte offset of a page inside the backing file
///
/// Addresses are 32-bit on disk, so files are limited to `i32::MAX` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageAddress(u32);

impl PageAddress {
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    pub const fn offset(self) -> u32 {
        self.0
    }

    /// On-disk form
    pub(crate) fn to_raw(self) -> i32 {
        // Never exceeds i32::MAX: allocation refuses to grow past it
        self.0 as i32
    }

    /// Negative raw values have no page behind them
    pub(crate) fn from_raw(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().map(Self)
    }
}

impl fmt::Display for PageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}
