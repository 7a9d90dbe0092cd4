//! Int-to-int B-tree
//!
//! ## Design
//! - **Paged**: every node is one page of a memory-mapped [`PagedFile`];
//!   pages are append-only and never freed
//! - **Hashed leaves**: leaves are open-addressed tables by default, so point
//!   lookups in a leaf cost a few probes instead of a binary search
//! - **Top-down splits**: `put` splits full nodes while descending, so an
//!   insert never has to walk back up the tree
//! - **Zero key inline**: key `0` marks free hash slots, so its mapping is
//!   kept in the tree variables instead of a page
//! - **Miss-then-put**: a `get` miss remembers its leaf; a `put` of the
//!   same key right after inserts there without a second descent
//!
//! The tree does not persist its own root. Callers keep the variables in a
//! header region of their choosing through [`HeaderStorage`] and replay them
//! with [`IntToIntBTree::persist_vars`] after reopening.
//!
//! ## Example
//! ```no_run
//! use int_btree::{HeaderFile, IntToIntBTree, StorageLockContext, TreeConfig};
//!
//! let config = TreeConfig::default();
//! let mut tree = IntToIntBTree::open("data/ids.bt", config.clone(), StorageLockContext::new(), true)?;
//! tree.put(42, 7)?;
//! assert_eq!(tree.get(42)?, Some(7));
//!
//! let mut header = HeaderFile::open("data/ids.bt.header", config.byte_order)?;
//! tree.persist_vars(&mut header, true)?;
//! header.sync()?;
//! tree.close()?;
//! # Ok::<(), int_btree::StorageError>(())
//! ```

use crate::config::TreeConfig;
use crate::index::layout::NodeGeometry;
use crate::index::node::{NodeView, Probe, Slot};
use crate::index::state::{TreeCore, TreeVars};
use crate::index::traversal::locate;
use crate::storage::{HeaderStorage, PageAddress, PagedFile, StorageLockContext};
use crate::Result;
use std::path::Path;

/// Leaf found by the last `get` that missed
#[derive(Debug, Clone, Copy)]
struct CachedMiss {
    key: i32,
    leaf: NodeView,
    full_pages_along_path: usize,
}

pub struct IntToIntBTree {
    pub(crate) core: TreeCore,
    last_miss: Option<CachedMiss>,
    pub(crate) optimized_inserts: u64,
}

impl IntToIntBTree {
    /// Open the tree's page file
    ///
    /// `initial` discards any existing file and starts an empty tree. When
    /// reopening, the tree stays empty until [`persist_vars`](Self::persist_vars)
    /// loads the saved variables.
    pub fn open(
        path: impl AsRef<Path>,
        config: TreeConfig,
        lock: StorageLockContext,
        initial: bool,
    ) -> Result<Self> {
        let geometry = NodeGeometry::new(&config)?;
        let storage = PagedFile::open(path, &config, lock, initial)?;

        tracing::debug!(
            path = %storage.path().display(),
            page_size = geometry.page_size,
            hash_capacity = geometry.hash_page_capacity,
            leaf_capacity = geometry.leaf_capacity(),
            initial,
            "opened int btree"
        );

        Ok(Self {
            core: TreeCore {
                storage,
                geometry,
                config,
                vars: TreeVars::default(),
            },
            last_miss: None,
            optimized_inserts: 0,
        })
    }

    pub fn get(&mut self, key: i32) -> Result<Option<i32>> {
        self.last_miss = None;

        if key == 0 {
            let vars = &self.core.vars;
            return Ok(vars.has_zero_key.then_some(vars.zero_key_value));
        }

        let root = match self.core.vars.root {
            Some(root) => root,
            None => return Ok(None),
        };

        let traversal = locate(&mut self.core, root, key, false)?;
        match traversal.probe {
            Probe::Found(index) => Ok(Some(traversal.leaf.value_at(&self.core, index)?)),
            Probe::Vacant(_) => {
                self.last_miss = Some(CachedMiss {
                    key,
                    leaf: traversal.leaf,
                    full_pages_along_path: traversal.full_pages_along_path,
                });
                Ok(None)
            }
        }
    }

    /// Insert or overwrite the mapping for `key`
    pub fn put(&mut self, key: i32, value: i32) -> Result<()> {
        let last_miss = self.last_miss.take();

        if key == 0 {
            self.core.vars.has_zero_key = true;
            self.core.vars.zero_key_value = value;
            return Ok(());
        }

        if let Some(mut miss) = last_miss.filter(|m| m.key == key && m.full_pages_along_path == 0) {
            miss.leaf.insert(&mut self.core, key, Slot::Value(value))?;
            self.core.vars.count = self.core.vars.count.wrapping_add(1);
            self.optimized_inserts += 1;
            return Ok(());
        }

        let root = match self.core.vars.root {
            Some(root) => root,
            None => self.allocate_root()?,
        };

        let mut traversal = locate(&mut self.core, root, key, true)?;
        match traversal.probe {
            Probe::Found(index) => traversal.leaf.set_slot_at(&mut self.core, index, Slot::Value(value)),
            Probe::Vacant(_) => {
                traversal.leaf.insert(&mut self.core, key, Slot::Value(value))?;
                self.core.vars.count = self.core.vars.count.wrapping_add(1);
                Ok(())
            }
        }
    }

    fn allocate_root(&mut self) -> Result<PageAddress> {
        let address = self.core.allocate_page()?;
        NodeView::init(&mut self.core, address, true)?;
        self.core.vars.root = Some(address);
        self.core.vars.height = 1;
        Ok(address)
    }

    /// Visit every mapping until `visitor` returns false
    ///
    /// The zero key comes first, then leaves from left to right. Returns
    /// false if the visitor stopped the enumeration.
    pub fn process_mappings<F>(&mut self, mut visitor: F) -> Result<bool>
    where
        F: FnMut(i32, i32) -> bool,
    {
        self.last_miss = None;
        self.flush()?;

        let vars = &self.core.vars;
        if vars.has_zero_key && !visitor(0, vars.zero_key_value) {
            return Ok(false);
        }

        match self.core.vars.root {
            Some(root) => self.visit(root, 1, &mut visitor),
            None => Ok(true),
        }
    }

    fn visit<F>(&self, address: PageAddress, depth: i32, visitor: &mut F) -> Result<bool>
    where
        F: FnMut(i32, i32) -> bool,
    {
        if depth > self.core.vars.height.saturating_add(1) {
            return Err(self.core.corrupted(format!("page {} lies below the tree height", address)));
        }

        let node = NodeView::load(&self.core, address)?;
        if node.is_leaf() {
            return node.process_mappings(&self.core, visitor);
        }

        for child in node.children(&self.core)? {
            if !self.visit(child, depth + 1, visitor)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Store (`to_disk`) or load the tree variables in `storage`
    pub fn persist_vars<S: HeaderStorage + ?Sized>(&mut self, storage: &mut S, to_disk: bool) -> Result<()> {
        self.last_miss = None;
        self.core.vars.persist(storage, to_disk)?;

        if !to_disk {
            // The header is authoritative: pages past it are growth reserve
            let pages = usize::try_from(self.core.vars.pages_count).map_err(|_| {
                self.core
                    .corrupted(format!("header records {} pages", self.core.vars.pages_count))
            })?;
            let len = pages
                .checked_mul(self.core.geometry.page_size)
                .ok_or_else(|| self.core.corrupted(format!("header records {} pages", pages)))?;
            self.core.storage.set_len(len)?;
        }
        Ok(())
    }

    /// Write dirty pages back to the file
    pub fn flush(&self) -> Result<()> {
        self.core.storage.flush()
    }

    /// Flush and close the page file
    pub fn close(self) -> Result<()> {
        tracing::debug!(
            path = %self.core.storage.path().display(),
            entries = self.len(),
            pages = self.core.vars.pages_count,
            "closing int btree"
        );
        self.core.storage.close()
    }

    /// Number of mappings, the zero key included
    pub fn len(&self) -> usize {
        self.core.vars.count as u32 as usize + usize::from(self.core.vars.has_zero_key)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn height(&self) -> i32 {
        self.core.vars.height
    }

    pub fn pages_count(&self) -> i32 {
        self.core.vars.pages_count
    }

    pub fn optimized_inserts(&self) -> u64 {
        self.optimized_inserts
    }

    pub fn geometry(&self) -> &NodeGeometry {
        &self.core.geometry
    }

    pub fn config(&self) -> &TreeConfig {
        &self.core.config
    }

    pub fn vars(&self) -> &TreeVars {
        &self.core.vars
    }

    pub fn path(&self) -> &Path {
        self.core.storage.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ByteOrder;
    use crate::storage::{HeaderBlock, HeaderFile};
    use crate::StorageError;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_tree(config: TreeConfig) -> (IntToIntBTree, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tree.bt");
        let tree = IntToIntBTree::open(path, config, StorageLockContext::new(), true).unwrap();
        (tree, temp_dir)
    }

    fn collect(tree: &mut IntToIntBTree) -> Vec<(i32, i32)> {
        let mut out = Vec::new();
        assert!(tree.process_mappings(|k, v| {
            out.push((k, v));
            true
        })
        .unwrap());
        out
    }

    fn assert_matches_model(tree: &mut IntToIntBTree, model: &BTreeMap<i32, i32>) {
        for (&key, &value) in model {
            assert_eq!(tree.get(key).unwrap(), Some(value), "key {}", key);
        }
        let mut mappings = collect(tree);
        mappings.sort_unstable();
        assert_eq!(mappings, model.iter().map(|(&k, &v)| (k, v)).collect::<Vec<_>>());
        assert_eq!(tree.len(), model.len());
    }

    #[test]
    fn test_small_page_root_split() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        let capacity = tree.geometry().leaf_capacity() as i32;

        for key in 1..=capacity {
            tree.put(key, key * 10).unwrap();
        }
        assert_eq!(tree.pages_count(), 1);
        assert_eq!(tree.height(), 1);
        assert!(tree.dump_statistics().unwrap().starts_with("pagesCount=1, height=1,"));

        tree.put(capacity + 1, -1).unwrap();
        assert_eq!(tree.pages_count(), 3);
        assert_eq!(tree.height(), 2);

        for key in 1..=capacity {
            assert_eq!(tree.get(key).unwrap(), Some(key * 10));
        }
        assert_eq!(tree.get(capacity + 1).unwrap(), Some(-1));
    }

    #[test]
    fn test_ascending_keys_enumerate_sorted() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing().with_hashed_leaves(false));
        let total = tree.geometry().leaf_capacity() as i32 * 3 + 1;

        let mut height = 0;
        for key in 1..=total {
            tree.put(key, key).unwrap();
            assert!(tree.height() >= height);
            height = tree.height();
        }

        let keys: Vec<i32> = collect(&mut tree).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (1..=total).collect::<Vec<_>>());
        assert!(tree.height() >= 2);
    }

    #[test]
    fn test_random_keys_with_sanity_checks() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        let total = tree.geometry().hash_page_capacity as usize * 5;
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut model = BTreeMap::new();

        while model.len() < total {
            let key: i32 = rng.gen();
            let value: i32 = rng.gen();
            tree.put(key, value).unwrap();
            model.insert(key, value);
        }

        assert_matches_model(&mut tree, &model);
    }

    #[test]
    fn test_colliding_keys_through_splits() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        let capacity = tree.geometry().hash_page_capacity as i32;

        // Every key hashes to primary slot 0
        let mut model = BTreeMap::new();
        for i in 1..=capacity * 5 {
            let key = i * capacity;
            tree.put(key, -i).unwrap();
            model.insert(key, -i);
        }

        assert!(tree.height() >= 2);
        assert!(tree.vars().max_steps_searched_in_hash > 0);
        assert_matches_model(&mut tree, &model);
    }

    #[test]
    fn test_deep_tree_random_order() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        let mut keys: Vec<i32> = (1..=20_000).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(7));

        let mut model = BTreeMap::new();
        for &key in &keys {
            tree.put(key, key ^ 0x5555).unwrap();
            model.insert(key, key ^ 0x5555);
        }

        assert!(tree.height() >= 3);
        assert_matches_model(&mut tree, &model);
    }

    #[test]
    fn test_overwrite_keeps_count() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        for key in 1..=200 {
            tree.put(key, 1).unwrap();
        }
        for key in 1..=200 {
            tree.put(key, 2).unwrap();
        }
        assert_eq!(tree.len(), 200);
        assert!((1..=200).all(|k| tree.get(k).unwrap() == Some(2)));
    }

    #[test]
    fn test_zero_key_is_stored_inline() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        assert_eq!(tree.get(0).unwrap(), None);

        tree.put(0, 77).unwrap();
        assert_eq!(tree.get(0).unwrap(), Some(77));
        assert_eq!(tree.pages_count(), 0);
        assert_eq!(tree.len(), 1);

        tree.put(5, 50).unwrap();
        tree.put(0, 78).unwrap();
        assert_eq!(collect(&mut tree), vec![(0, 78), (5, 50)]);
    }

    #[test]
    fn test_empty_tree_touches_no_pages() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        assert_eq!(tree.get(12345).unwrap(), None);
        assert_eq!(tree.pages_count(), 0);
        assert!(tree.core.storage.is_empty());
        assert!(collect(&mut tree).is_empty());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_miss_then_put_skips_descent() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        tree.put(1, 1).unwrap();

        assert_eq!(tree.get(2).unwrap(), None);
        tree.put(2, 20).unwrap();
        assert_eq!(tree.optimized_inserts(), 1);

        // A get of another key or an intervening put drops the cached leaf
        assert_eq!(tree.get(3).unwrap(), None);
        assert_eq!(tree.get(4).unwrap(), None);
        tree.put(3, 30).unwrap();
        assert_eq!(tree.optimized_inserts(), 1);

        assert_eq!(tree.get(2).unwrap(), Some(20));
        assert_eq!(tree.get(3).unwrap(), Some(30));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_miss_then_put_into_full_leaf_splits() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        let capacity = tree.geometry().leaf_capacity() as i32;
        for key in 1..=capacity {
            tree.put(key, key).unwrap();
        }

        assert_eq!(tree.get(capacity + 1).unwrap(), None);
        tree.put(capacity + 1, 0).unwrap();
        assert_eq!(tree.optimized_inserts(), 0);
        assert_eq!(tree.height(), 2);
        assert_eq!(tree.get(capacity + 1).unwrap(), Some(0));
    }

    #[test]
    fn test_offload_before_split() {
        for hashed in [false, true] {
            let config = TreeConfig::for_testing()
                .with_hashed_leaves(hashed)
                .with_offload_before_split(true);
            let (mut tree, _temp) = create_test_tree(config);
            let mut rng = StdRng::seed_from_u64(99);
            let mut model = BTreeMap::new();

            for _ in 0..3000 {
                let key = rng.gen_range(1..50_000);
                tree.put(key, key * 3).unwrap();
                model.insert(key, key * 3);
            }
            assert_matches_model(&mut tree, &model);
        }
    }

    #[test]
    fn test_offload_packs_ascending_sorted_leaves() {
        let plain = {
            let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing().with_hashed_leaves(false));
            for key in (1..=2000).rev() {
                tree.put(key, key).unwrap();
            }
            tree.pages_count()
        };

        let config = TreeConfig::for_testing()
            .with_hashed_leaves(false)
            .with_offload_before_split(true);
        let (mut tree, _temp) = create_test_tree(config);
        for key in (1..=2000).rev() {
            tree.put(key, key).unwrap();
        }
        assert!(tree.pages_count() < plain);
        assert!((1..=2000).all(|k| tree.get(k).unwrap() == Some(k)));
    }

    #[test]
    fn test_process_mappings_stops_early() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        for key in 1..=500 {
            tree.put(key, key).unwrap();
        }

        let mut seen = 0;
        let completed = tree
            .process_mappings(|_, _| {
                seen += 1;
                seen < 10
            })
            .unwrap();
        assert!(!completed);
        assert_eq!(seen, 10);
    }

    #[test]
    fn test_reopen_through_header_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("persist.bt");
        let header_path = temp_dir.path().join("persist.bt.header");
        let config = TreeConfig::for_testing().with_byte_order(ByteOrder::Big);

        let mut model = BTreeMap::new();
        {
            let mut tree = IntToIntBTree::open(&path, config.clone(), StorageLockContext::new(), true).unwrap();
            for key in (1..=1500).map(|i| i * 7919) {
                tree.put(key, -key).unwrap();
                model.insert(key, -key);
            }
            tree.put(0, 3).unwrap();
            model.insert(0, 3);

            let mut header = HeaderFile::open(&header_path, config.byte_order).unwrap();
            tree.flush().unwrap();
            tree.persist_vars(&mut header, true).unwrap();
            header.sync().unwrap();
            tree.close().unwrap();
        }

        let mut tree = IntToIntBTree::open(&path, config.clone(), StorageLockContext::new(), false).unwrap();
        assert_eq!(tree.get(7919).unwrap(), None);

        let mut header = HeaderFile::open(&header_path, config.byte_order).unwrap();
        tree.persist_vars(&mut header, false).unwrap();
        assert_matches_model(&mut tree, &model);

        tree.put(1, 1).unwrap();
        assert_eq!(tree.get(1).unwrap(), Some(1));
    }

    #[test]
    fn test_unclean_reopen_does_not_grow_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("unclean.bt");
        let config = TreeConfig::for_testing();
        let mut header = HeaderBlock::new(config.byte_order);
        let mut model = BTreeMap::new();

        for round in 0..3 {
            let mut tree = IntToIntBTree::open(&path, config.clone(), StorageLockContext::new(), round == 0).unwrap();
            if round > 0 {
                tree.persist_vars(&mut header, false).unwrap();
                assert_eq!(tree.core.storage.page_count(), tree.pages_count() as usize);
            }
            for key in (1..=200).map(|i| round * 1000 + i) {
                tree.put(key, key).unwrap();
                model.insert(key, key);
            }
            tree.persist_vars(&mut header, true).unwrap();
            drop(tree);

            let file_len = std::fs::metadata(&path).unwrap().len();
            assert_eq!(file_len, config.effective_grow_step() as u64, "round {}", round);
        }

        let mut tree = IntToIntBTree::open(&path, config.clone(), StorageLockContext::new(), false).unwrap();
        tree.persist_vars(&mut header, false).unwrap();
        assert_matches_model(&mut tree, &model);
    }

    #[test]
    fn test_header_with_too_many_pages_is_corruption() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        let mut block = HeaderBlock::new(ByteOrder::Native);
        block.persist_int(4, 1000, true).unwrap();

        let err = tree.persist_vars(&mut block, false).unwrap_err();
        assert!(matches!(err, StorageError::CorruptedFile { .. }));
    }

    #[test]
    fn test_persist_vars_matches_counters() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        for key in 1..=100 {
            tree.put(key, key).unwrap();
        }
        let mut block = HeaderBlock::new(ByteOrder::Little);
        tree.persist_vars(&mut block, true).unwrap();

        let mut vars = TreeVars::default();
        vars.persist(&mut block, false).unwrap();
        assert_eq!(&vars, tree.vars());
        assert_eq!(vars.count, 100);
        assert_eq!(vars.height, 2);
    }

    #[test]
    fn test_traversal_deeper_than_height_is_corruption() {
        let (mut tree, _temp) = create_test_tree(TreeConfig::for_testing());
        for key in 1..=100 {
            tree.put(key, key).unwrap();
        }
        tree.core.vars.height = 0;

        let err = tree.get(50).unwrap_err();
        assert!(err.is_corruption());
    }
}
