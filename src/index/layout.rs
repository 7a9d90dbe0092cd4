//! Page geometry
//!
//! ```text
//! Page: [flags:8 | count:16 | unused:8][next_page:32][slot 0][slot 1]...
//! Slot: [value or negated child address:32][key:32]
//! ```
//!
//! An interior node with `n` keys uses `n + 1` slots: the value word of slot
//! `n` holds the rightmost child. A hashed leaf uses the slot array as an
//! open-addressed table of `hash_page_capacity` entries where key `0` marks
//! an empty slot.

use crate::config::TreeConfig;
use crate::Result;

/// Header bytes at the start of every page
pub const RESERVED_META_PAGE_LEN: usize = 8;

/// Bytes per slot
pub const INTERIOR_SIZE: usize = 8;

/// Key position inside a slot
pub const KEY_OFFSET: usize = 4;

/// Offset of the next-page pointer inside the header
pub const NEXT_PAGE_OFFSET: usize = 4;

/// Fill factor of hashed leaves relative to the table capacity
const HASH_FILL_FACTOR: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeGeometry {
    pub page_size: usize,
    /// Children of a full interior node (keys + 1)
    pub max_interior_nodes: u16,
    /// Entries of a full sorted leaf
    pub max_leaf_nodes: u16,
    /// Entries of a full hashed leaf
    pub max_leaf_nodes_in_hash: u16,
    /// Slots of the hash table; an odd prime
    pub hash_page_capacity: u16,
    pub hashed_leaves: bool,
}

impl NodeGeometry {
    pub fn new(config: &TreeConfig) -> Result<Self> {
        config.validate()?;

        let slots = (config.page_size - RESERVED_META_PAGE_LEN) / INTERIOR_SIZE - 1;
        debug_assert!(slots % 2 == 0 && slots < i16::MAX as usize);

        // Double hashing only visits every slot when the capacity is prime
        let mut capacity = slots + 1;
        while !is_prime(capacity) {
            capacity -= 2;
        }

        let mut in_hash = (capacity as f64 * HASH_FILL_FACTOR) as usize;
        if in_hash % 2 == 1 {
            in_hash += 1;
        }

        Ok(Self {
            page_size: config.page_size,
            max_interior_nodes: slots as u16,
            max_leaf_nodes: slots as u16,
            max_leaf_nodes_in_hash: in_hash as u16,
            hash_page_capacity: capacity as u16,
            hashed_leaves: config.hashed_leaves,
        })
    }

    /// Entries a leaf holds before it must split
    pub fn leaf_capacity(&self) -> usize {
        if self.hashed_leaves {
            self.max_leaf_nodes_in_hash as usize
        } else {
            self.max_leaf_nodes as usize
        }
    }

    #[inline]
    pub fn slot_offset(index: usize) -> usize {
        RESERVED_META_PAGE_LEN + index * INTERIOR_SIZE
    }

    #[inline]
    pub fn key_offset(index: usize) -> usize {
        Self::slot_offset(index) + KEY_OFFSET
    }
}

pub fn is_prime(value: usize) -> bool {
    if value < 2 {
        return false;
    }
    if value % 2 == 0 {
        return value == 2;
    }
    let mut divisor = 3;
    while divisor * divisor <= value {
        if value % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}
