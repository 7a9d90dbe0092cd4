//! Tree configuration and on-disk byte order
//!
//! The page size and byte order are part of the file format: a file must be
//! reopened with the same values it was created with. The remaining flags
//! only change runtime behavior.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// Default page size (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size that still leaves room for a usable hashed leaf
pub const MIN_PAGE_SIZE: usize = 64;

/// Children counts are stored in 16 bits
pub const MAX_PAGE_SIZE: usize = 65536;

/// Default physical growth step of the backing file (1MB)
pub const DEFAULT_GROW_STEP: usize = 1024 * 1024;

const BASE_FORMAT_VERSION: i32 = 4;
const NATIVE_ORDER_VERSION_TAG: i32 = 0xFF;

/// Byte order of every integer written to pages and header blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ByteOrder {
    Big,
    Little,
    /// Platform order
    #[default]
    Native,
}

impl ByteOrder {
    #[inline]
    pub fn read_i32(self, bytes: &[u8]) -> i32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            ByteOrder::Big => i32::from_be_bytes(raw),
            ByteOrder::Little => i32::from_le_bytes(raw),
            ByteOrder::Native => i32::from_ne_bytes(raw),
        }
    }

    #[inline]
    pub fn write_i32(self, bytes: &mut [u8], value: i32) {
        let raw = match self {
            ByteOrder::Big => value.to_be_bytes(),
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Native => value.to_ne_bytes(),
        };
        bytes[..4].copy_from_slice(&raw);
    }
}

/// Format version reported for files written with `order`.
///
/// Files written in native order carry a distinct version so that a reader
/// on a different platform can tell them apart.
pub fn format_version(order: ByteOrder) -> i32 {
    match order {
        ByteOrder::Native => BASE_FORMAT_VERSION + NATIVE_ORDER_VERSION_TAG,
        ByteOrder::Big | ByteOrder::Little => BASE_FORMAT_VERSION,
    }
}

/// B-tree configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Page size in bytes; multiple of 16 within `MIN_PAGE_SIZE..=MAX_PAGE_SIZE`
    pub page_size: usize,

    /// Byte order of the page contents
    pub byte_order: ByteOrder,

    /// Convert every leaf to an open-addressed hash table at its first insert
    pub hashed_leaves: bool,

    /// Verify node invariants after every mutation (O(n) per page)
    pub sanity_check: bool,

    /// Trace node contents around splits and offloads
    pub dump_trace: bool,

    /// Move entries into an under-full sibling leaf instead of splitting when possible
    pub offload_before_split: bool,

    /// Physical growth step of the backing file, rounded up to `page_size`
    pub grow_step: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            byte_order: ByteOrder::default(),
            hashed_leaves: true,
            sanity_check: false,
            dump_trace: false,
            offload_before_split: false,
            grow_step: DEFAULT_GROW_STEP,
        }
    }
}

impl TreeConfig {
    /// Small pages with all invariant checks on
    pub fn for_testing() -> Self {
        Self {
            page_size: 512,
            sanity_check: true,
            grow_step: 64 * 1024,
            ..Default::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_hashed_leaves(mut self, enabled: bool) -> Self {
        self.hashed_leaves = enabled;
        self
    }

    pub fn with_sanity_check(mut self, enabled: bool) -> Self {
        self.sanity_check = enabled;
        self
    }

    pub fn with_dump_trace(mut self, enabled: bool) -> Self {
        self.dump_trace = enabled;
        self
    }

    pub fn with_offload_before_split(mut self, enabled: bool) -> Self {
        self.offload_before_split = enabled;
        self
    }

    pub fn with_grow_step(mut self, grow_step: usize) -> Self {
        self.grow_step = grow_step;
        self
    }

    /// Growth step rounded up to a whole number of pages (at least one page)
    pub fn effective_grow_step(&self) -> usize {
        let pages = self.grow_step.div_ceil(self.page_size).max(1);
        pages * self.page_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "page size {} outside {}..={}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        // Keeps the per-page slot count even, which the split arithmetic relies on
        if self.page_size % 16 != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "page size {} is not a multiple of 16",
                self.page_size
            )));
        }
        if self.grow_step == 0 {
            return Err(StorageError::InvalidArgument("grow step must be positive".into()));
        }
        Ok(())
    }
}
