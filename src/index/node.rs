//! Node view: one page interpreted as an interior node, sorted leaf or hashed leaf
//!
//! ## Node kinds
//! - **Interior**: sorted keys, `count + 1` child addresses. Child addresses
//!   are stored negated on disk; [`Slot`] carries the decoded form
//! - **Sorted leaf**: sorted `(key, value)` slots, no duplicates
//! - **Hashed leaf**: the same slots used as an open-addressed table with
//!   double hashing. Key `0` marks a free slot, which is why the tree keeps
//!   key `0` out of the pages entirely
//!
//! A leaf becomes hashed at its first insertion when hashed leaves are
//! enabled and keeps that representation afterwards.
//!
//! `NodeView` caches the header (flags and count) of its page. Every mutation
//! goes through the view so the cached header and the page never disagree.

use crate::index::layout::{NodeGeometry, INTERIOR_SIZE, NEXT_PAGE_OFFSET};
use crate::index::state::{TreeCore, UNDEFINED_ADDRESS};
use crate::storage::{PageAddress, PageBytes};
use crate::Result;

pub const INDEX_LEAF_MASK: u8 = 0x1;
pub const HASHED_LEAF_MASK: u8 = 0x2;

const FLAGS_SHIFT: u32 = 24;
const LENGTH_SHIFT: u32 = 8;
const LENGTH_MASK: u32 = 0xFFFF;

/// Key value of an empty hash slot
pub const HASH_FREE: i32 = 0;

/// Decoded first word of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Leaf value
    Value(i32),
    /// Interior child pointer
    Child(PageAddress),
}

impl Slot {
    fn encode(self) -> i32 {
        match self {
            Slot::Value(value) => value,
            Slot::Child(address) => -address.to_raw(),
        }
    }
}

/// Outcome of searching a node for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Slot holding the key
    Found(usize),
    /// Insertion point (sorted nodes) or first free slot (hashed leaves)
    Vacant(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeView {
    address: PageAddress,
    flags: u8,
    count: u16,
}

impl NodeView {
    /// Read the header of an existing page
    pub fn load(core: &TreeCore, address: PageAddress) -> Result<Self> {
        let page = core.storage.page(address)?;
        let word = page.read_i32(0) as u32;

        Ok(Self {
            address,
            flags: (word >> FLAGS_SHIFT) as u8,
            count: ((word >> LENGTH_SHIFT) & LENGTH_MASK) as u16,
        })
    }

    /// Format a freshly allocated page as an empty node
    pub fn init(core: &mut TreeCore, address: PageAddress, leaf: bool) -> Result<Self> {
        let node = Self {
            address,
            flags: if leaf { INDEX_LEAF_MASK } else { 0 },
            count: 0,
        };
        let mut page = core.storage.page_mut(address)?;
        page.write_i32(0, node.header_word());
        page.write_i32(NEXT_PAGE_OFFSET, UNDEFINED_ADDRESS);
        Ok(node)
    }

    pub fn address(&self) -> PageAddress {
        self.address
    }

    pub fn count(&self) -> usize {
        self.count as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & INDEX_LEAF_MASK != 0
    }

    pub fn is_hashed(&self) -> bool {
        self.is_leaf() && self.flags & HASHED_LEAF_MASK != 0
    }

    pub fn kind(&self) -> &'static str {
        match (self.is_leaf(), self.is_hashed()) {
            (false, _) => "interior",
            (true, false) => "sorted leaf",
            (true, true) => "hashed leaf",
        }
    }

    fn header_word(&self) -> i32 {
        (((self.flags as u32) << FLAGS_SHIFT) | ((self.count as u32) << LENGTH_SHIFT)) as i32
    }

    pub(crate) fn set_count(&mut self, core: &mut TreeCore, count: usize) -> Result<()> {
        self.count = count as u16;
        self.store_header(core)
    }

    fn store_header(&self, core: &mut TreeCore) -> Result<()> {
        core.storage.page_mut(self.address)?.write_i32(0, self.header_word());
        Ok(())
    }

    pub fn max_children(&self, geometry: &NodeGeometry) -> usize {
        if !self.is_leaf() {
            geometry.max_interior_nodes as usize
        } else if self.is_hashed() {
            geometry.max_leaf_nodes_in_hash as usize
        } else {
            geometry.max_leaf_nodes as usize
        }
    }

    /// Interior nodes also count their rightmost child
    pub fn is_full(&self, geometry: &NodeGeometry) -> bool {
        let used = self.count() + usize::from(!self.is_leaf());
        used >= self.max_children(geometry)
    }

    pub fn key_at(&self, core: &TreeCore, index: usize) -> Result<i32> {
        Ok(core.storage.page(self.address)?.read_i32(NodeGeometry::key_offset(index)))
    }

    pub fn set_key_at(&self, core: &mut TreeCore, index: usize, key: i32) -> Result<()> {
        core.storage
            .page_mut(self.address)?
            .write_i32(NodeGeometry::key_offset(index), key);
        Ok(())
    }

    pub fn slot_at(&self, core: &TreeCore, index: usize) -> Result<Slot> {
        let raw = core.storage.page(self.address)?.read_i32(NodeGeometry::slot_offset(index));
        self.decode_slot(core, raw)
    }

    fn decode_slot(&self, core: &TreeCore, raw: i32) -> Result<Slot> {
        if self.is_leaf() {
            return Ok(Slot::Value(raw));
        }
        raw.checked_neg()
            .and_then(PageAddress::from_raw)
            .map(Slot::Child)
            .ok_or_else(|| core.corrupted(format!("invalid child pointer {} in page {}", raw, self.address)))
    }

    pub fn set_slot_at(&self, core: &mut TreeCore, index: usize, slot: Slot) -> Result<()> {
        core.storage
            .page_mut(self.address)?
            .write_i32(NodeGeometry::slot_offset(index), slot.encode());
        Ok(())
    }

    pub fn value_at(&self, core: &TreeCore, index: usize) -> Result<i32> {
        match self.slot_at(core, index)? {
            Slot::Value(value) => Ok(value),
            Slot::Child(_) => Err(core.corrupted(format!("page {} is not a leaf", self.address))),
        }
    }

    pub fn child_at(&self, core: &TreeCore, index: usize) -> Result<PageAddress> {
        match self.slot_at(core, index)? {
            Slot::Child(address) => Ok(address),
            Slot::Value(_) => Err(core.corrupted(format!("leaf page {} has no children", self.address))),
        }
    }

    /// All `count + 1` children, copied out of the page
    pub fn children(&self, core: &TreeCore) -> Result<Vec<PageAddress>> {
        (0..=self.count()).map(|i| self.child_at(core, i)).collect()
    }

    pub fn next_page(&self, core: &TreeCore) -> Result<Option<PageAddress>> {
        let raw = core.storage.page(self.address)?.read_i32(NEXT_PAGE_OFFSET);
        Ok(PageAddress::from_raw(raw))
    }

    pub fn set_next_page(&self, core: &mut TreeCore, next: Option<PageAddress>) -> Result<()> {
        let raw = next.map_or(UNDEFINED_ADDRESS, PageAddress::to_raw);
        core.storage.page_mut(self.address)?.write_i32(NEXT_PAGE_OFFSET, raw);
        Ok(())
    }

    pub fn search(&self, core: &mut TreeCore, key: i32) -> Result<Probe> {
        if self.is_hashed() {
            return self.hash_index(core, key);
        }

        let page = core.storage.page(self.address)?;
        let (mut low, mut high) = (0, self.count());
        while low < high {
            let mid = low + (high - low) / 2;
            match page.read_i32(NodeGeometry::key_offset(mid)).cmp(&key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Ok(Probe::Found(mid)),
            }
        }
        Ok(Probe::Vacant(low))
    }

    /// Double-hashing lookup (Knuth vol. 3, 6.4 algorithm D)
    ///
    /// The probe step `1 + hash % (capacity - 2)` is never a multiple of the
    /// prime capacity, so the sequence visits every slot before repeating.
    pub fn hash_index(&self, core: &mut TreeCore, key: i32) -> Result<Probe> {
        let (probe, steps) = self.probe_hash(core, key)?;
        core.vars.record_hash_search(steps as i32);
        Ok(probe)
    }

    fn probe_hash(&self, core: &TreeCore, key: i32) -> Result<(Probe, usize)> {
        let capacity = core.geometry.hash_page_capacity as usize;
        let hash = (key & 0x7fff_ffff) as usize;
        let mut index = hash % capacity;

        let page = core.storage.page(self.address)?;
        let mut key_at_index = page.read_i32(NodeGeometry::key_offset(index));
        let mut steps = 0;

        if key_at_index != key && key_at_index != HASH_FREE {
            let step = 1 + hash % (capacity - 2);
            loop {
                index = if index >= step { index - step } else { index + capacity - step };
                key_at_index = page.read_i32(NodeGeometry::key_offset(index));
                steps += 1;
                if steps > capacity {
                    return Err(core.corrupted(format!(
                        "hash probe for key {} in page {} exceeded {} slots",
                        key, self.address, capacity
                    )));
                }
                if key_at_index == key || key_at_index == HASH_FREE {
                    break;
                }
            }
        }

        let probe = if key_at_index == HASH_FREE {
            Probe::Vacant(index)
        } else {
            Probe::Found(index)
        };
        Ok((probe, steps))
    }

    /// Insert a key that is not yet present. The node must not be full.
    pub fn insert(&mut self, core: &mut TreeCore, key: i32, slot: Slot) -> Result<()> {
        if core.config.sanity_check && self.is_full(&core.geometry) {
            return Err(core.sanity(format!("insert of {} into full {} {}", key, self.kind(), self.address)));
        }

        let record_count = self.count();

        if self.is_leaf() {
            if record_count == 0 && core.geometry.hashed_leaves {
                self.flags |= HASHED_LEAF_MASK;
                core.vars.hashed_pages_count = core.vars.hashed_pages_count.wrapping_add(1);
            }

            if self.is_hashed() {
                let index = match self.hash_index(core, key)? {
                    Probe::Vacant(index) => index,
                    Probe::Found(index) => {
                        if core.config.sanity_check {
                            return Err(core.sanity(format!("key {} already present in {}", key, self.address)));
                        }
                        index
                    }
                };
                self.count += 1;

                let mut page = core.storage.page_mut(self.address)?;
                page.write_i32(NodeGeometry::key_offset(index), key);
                page.write_i32(NodeGeometry::slot_offset(index), slot.encode());
                page.write_i32(0, self.header_word());
                drop(page);

                return self.after_mutation(core);
            }
        }

        let index = match self.search(core, key)? {
            Probe::Vacant(index) => index,
            Probe::Found(index) => {
                if core.config.sanity_check {
                    return Err(core.sanity(format!("key {} already present in {}", key, self.address)));
                }
                index
            }
        };

        let moved = record_count - index;
        core.vars.moved_members_count = core.vars.moved_members_count.wrapping_add(moved as i32);
        self.count += 1;

        let mut page = core.storage.page_mut(self.address)?;
        if self.is_leaf() {
            if moved > 0 {
                page.copy_within(
                    NodeGeometry::slot_offset(index)..NodeGeometry::slot_offset(record_count),
                    NodeGeometry::slot_offset(index + 1),
                );
            }
            page.write_i32(NodeGeometry::key_offset(index), key);
            page.write_i32(NodeGeometry::slot_offset(index), slot.encode());
        } else {
            // [A_i K_i A_i+1 ... K_n-1 A_n] -> [A_i K C K_i A_i+1 ... A_n]:
            // the child left of the new key stays put, the new child goes right of it
            page.copy_within(
                NodeGeometry::key_offset(index)..NodeGeometry::key_offset(record_count),
                NodeGeometry::key_offset(index) + INTERIOR_SIZE,
            );
            page.write_i32(NodeGeometry::key_offset(index), key);
            page.write_i32(NodeGeometry::slot_offset(index + 1), slot.encode());
        }
        page.write_i32(0, self.header_word());
        drop(page);

        self.after_mutation(core)
    }

    /// Live entries of a leaf sorted by key
    pub fn sorted_entries(&self, core: &TreeCore) -> Result<Vec<(i32, i32)>> {
        let page = core.storage.page(self.address)?;
        let mut entries = Vec::with_capacity(self.count());

        if self.is_hashed() {
            for index in 0..core.geometry.hash_page_capacity as usize {
                let key = page.read_i32(NodeGeometry::key_offset(index));
                if key == HASH_FREE {
                    continue;
                }
                if entries.len() == self.count() {
                    return Err(core.corrupted(format!(
                        "hashed leaf {} holds more than its {} recorded entries",
                        self.address,
                        self.count()
                    )));
                }
                entries.push((key, page.read_i32(NodeGeometry::slot_offset(index))));
            }
            entries.sort_unstable_by_key(|&(key, _)| key);
        } else {
            for index in 0..self.count() {
                entries.push((
                    page.read_i32(NodeGeometry::key_offset(index)),
                    page.read_i32(NodeGeometry::slot_offset(index)),
                ));
            }
        }
        Ok(entries)
    }

    /// Empty a leaf so it can be refilled; hashed leaves get their table cleared
    pub fn reset_leaf(&mut self, core: &mut TreeCore) -> Result<()> {
        if self.is_hashed() {
            let mut page = core.storage.page_mut(self.address)?;
            for index in 0..core.geometry.hash_page_capacity as usize {
                page.write_i32(NodeGeometry::key_offset(index), HASH_FREE);
            }
            drop(page);
            core.vars.hashed_pages_count = core.vars.hashed_pages_count.wrapping_sub(1);
        }
        self.flags = INDEX_LEAF_MASK;
        self.set_count(core, 0)
    }

    /// Replace a leaf's content with `entries`, which must be sorted
    pub fn rebuild_leaf(&mut self, core: &mut TreeCore, entries: &[(i32, i32)]) -> Result<()> {
        self.reset_leaf(core)?;
        for &(key, value) in entries {
            self.insert(core, key, Slot::Value(value))?;
        }
        Ok(())
    }

    /// Feed live entries to `visitor` until it returns false
    ///
    /// Sorted leaves are visited in key order, hashed leaves in slot order.
    pub fn process_mappings<F>(&self, core: &TreeCore, visitor: &mut F) -> Result<bool>
    where
        F: FnMut(i32, i32) -> bool,
    {
        let page = core.storage.page(self.address)?;

        if self.is_hashed() {
            for index in 0..core.geometry.hash_page_capacity as usize {
                let key = page.read_i32(NodeGeometry::key_offset(index));
                if key != HASH_FREE && !visitor(key, page.read_i32(NodeGeometry::slot_offset(index))) {
                    return Ok(false);
                }
            }
        } else {
            for index in 0..self.count() {
                let key = page.read_i32(NodeGeometry::key_offset(index));
                if !visitor(key, page.read_i32(NodeGeometry::slot_offset(index))) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn after_mutation(&self, core: &TreeCore) -> Result<()> {
        if core.config.sanity_check {
            self.check_invariants(core)?;
        }
        Ok(())
    }

    pub fn check_invariants(&self, core: &TreeCore) -> Result<()> {
        let used = self.count() + usize::from(!self.is_leaf());
        if used > self.max_children(&core.geometry) {
            return Err(core.sanity(format!(
                "{} {} holds {} entries, limit {}",
                self.kind(),
                self.address,
                self.count(),
                self.max_children(&core.geometry)
            )));
        }

        if self.is_hashed() {
            let mut live = 0;
            for index in 0..core.geometry.hash_page_capacity as usize {
                let key = self.key_at(core, index)?;
                if key == HASH_FREE {
                    continue;
                }
                live += 1;
                if self.probe_hash(core, key)?.0 != Probe::Found(index) {
                    return Err(core.sanity(format!("key {} unreachable in hashed leaf {}", key, self.address)));
                }
            }
            if live != self.count() {
                return Err(core.sanity(format!(
                    "hashed leaf {} has {} live slots but count {}",
                    self.address,
                    live,
                    self.count()
                )));
            }
            return Ok(());
        }

        for index in 1..self.count() {
            if self.key_at(core, index - 1)? >= self.key_at(core, index)? {
                return Err(core.sanity(format!("keys out of order at {} in {}", index, self.address)));
            }
        }
        if !self.is_leaf() {
            self.children(core)?;
        }
        Ok(())
    }

    /// Trace the node's content when dump tracing is enabled
    pub fn dump(&self, core: &TreeCore, label: &str) {
        if !core.config.dump_trace {
            return;
        }
        let content = if self.is_leaf() {
            self.sorted_entries(core).map(|entries| format!("{:?}", entries))
        } else {
            (0..self.count())
                .map(|i| self.key_at(core, i))
                .collect::<Result<Vec<_>>>()
                .and_then(|keys| self.children(core).map(|children| format!("keys={:?} children={:?}", keys, children)))
        };
        match content {
            Ok(content) => tracing::trace!(
                page = %self.address,
                kind = self.kind(),
                count = self.count(),
                "{}: {}",
                label,
                content
            ),
            Err(e) => tracing::trace!(page = %self.address, error = %e, "{}: unreadable", label),
        }
    }
}
