//! Tree variables and the shared context node operations work against

use crate::config::TreeConfig;
use crate::index::layout::NodeGeometry;
use crate::storage::{HeaderStorage, PageAddress, PagedFile};
use crate::{Result, StorageError};

/// On-disk marker for "no root"
pub const UNDEFINED_ADDRESS: i32 = -1;

/// Top byte of the height word flags a stored zero key
const HAS_ZERO_KEY_MASK: i32 = 0xFF00_0000_u32 as i32;

/// Header offsets of the persisted variables
const HEIGHT_OFFSET: usize = 0;
const PAGES_COUNT_OFFSET: usize = 4;
const MOVED_MEMBERS_OFFSET: usize = 8;
const MAX_HASH_STEPS_OFFSET: usize = 12;
const COUNT_OFFSET: usize = 16;
const HASH_REQUESTS_OFFSET: usize = 20;
const TOTAL_HASH_STEPS_OFFSET: usize = 24;
const HASHED_PAGES_OFFSET: usize = 28;
const ROOT_ADDRESS_OFFSET: usize = 32;
const ZERO_KEY_VALUE_OFFSET: usize = 36;

/// Everything the tree persists in its header block
///
/// Counters are 32-bit words on disk and wrap rather than fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeVars {
    pub root: Option<PageAddress>,
    /// Deepest traversal seen, in levels
    pub height: i32,
    pub pages_count: i32,
    pub moved_members_count: i32,
    pub max_steps_searched_in_hash: i32,
    /// Entries stored in the tree, excluding the zero key
    pub count: i32,
    pub hash_search_requests: i32,
    pub total_hash_steps_searched: i32,
    pub hashed_pages_count: i32,
    pub has_zero_key: bool,
    pub zero_key_value: i32,
}

impl TreeVars {
    /// Store (`to_disk`) or load the variables at their fixed header offsets
    pub fn persist<S: HeaderStorage + ?Sized>(&mut self, storage: &mut S, to_disk: bool) -> Result<()> {
        let zero_flag = if self.has_zero_key { HAS_ZERO_KEY_MASK } else { 0 };
        let word = storage.persist_int(HEIGHT_OFFSET, self.height | zero_flag, to_disk)?;
        self.has_zero_key = word & HAS_ZERO_KEY_MASK != 0;
        self.height = word & !HAS_ZERO_KEY_MASK;

        self.pages_count = storage.persist_int(PAGES_COUNT_OFFSET, self.pages_count, to_disk)?;
        self.moved_members_count = storage.persist_int(MOVED_MEMBERS_OFFSET, self.moved_members_count, to_disk)?;
        self.max_steps_searched_in_hash =
            storage.persist_int(MAX_HASH_STEPS_OFFSET, self.max_steps_searched_in_hash, to_disk)?;
        self.count = storage.persist_int(COUNT_OFFSET, self.count, to_disk)?;
        self.hash_search_requests = storage.persist_int(HASH_REQUESTS_OFFSET, self.hash_search_requests, to_disk)?;
        self.total_hash_steps_searched =
            storage.persist_int(TOTAL_HASH_STEPS_OFFSET, self.total_hash_steps_searched, to_disk)?;
        self.hashed_pages_count = storage.persist_int(HASHED_PAGES_OFFSET, self.hashed_pages_count, to_disk)?;

        let root = self.root.map_or(UNDEFINED_ADDRESS, PageAddress::to_raw);
        let root = storage.persist_int(ROOT_ADDRESS_OFFSET, root, to_disk)?;
        // A zeroed header block describes a tree that never allocated a page
        self.root = if self.pages_count > 0 {
            PageAddress::from_raw(root)
        } else {
            None
        };

        self.zero_key_value = storage.persist_int(ZERO_KEY_VALUE_OFFSET, self.zero_key_value, to_disk)?;
        Ok(())
    }

    pub(crate) fn record_hash_search(&mut self, steps: i32) {
        self.hash_search_requests = self.hash_search_requests.wrapping_add(1);
        self.total_hash_steps_searched = self.total_hash_steps_searched.wrapping_add(steps);
        self.max_steps_searched_in_hash = self.max_steps_searched_in_hash.max(steps);
    }
}

/// Storage, geometry and variables shared by every node operation
pub(crate) struct TreeCore {
    pub storage: PagedFile,
    pub geometry: NodeGeometry,
    pub config: TreeConfig,
    pub vars: TreeVars,
}

impl TreeCore {
    pub fn allocate_page(&mut self) -> Result<PageAddress> {
        let address = self.storage.allocate_page()?;
        self.vars.pages_count = self.vars.pages_count.wrapping_add(1);
        Ok(address)
    }

    pub fn corrupted(&self, reason: impl Into<String>) -> StorageError {
        StorageError::corrupted(self.storage.path(), reason)
    }

    /// Invariant failure; only produced when sanity checks are enabled
    pub fn sanity(&self, reason: impl Into<String>) -> StorageError {
        StorageError::SanityCheck(format!("{}: {}", self.storage.path().display(), reason.into()))
    }
}
