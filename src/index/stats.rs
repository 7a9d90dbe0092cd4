//! Tree statistics

use crate::index::btree::IntToIntBTree;
use crate::index::node::NodeView;
use crate::storage::PageAddress;
use crate::Result;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TreeStatistics {
    pub pages_count: i32,
    pub height: i32,
    pub entries: usize,
    pub moved_members: i32,
    pub optimized_inserts: u64,
    pub max_hash_steps: i32,
    pub avg_hash_steps: i32,
    pub hashed_pages: i32,
    pub leaf_pages: usize,
    pub interior_pages: usize,
    /// Filled share of the leaf slots actually available
    pub leaf_usage_percent: u32,
    /// Filled share if every leaf were sorted
    pub leaf_usage_if_sorted_percent: u32,
    pub file_size: usize,
}

impl fmt::Display for TreeStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pagesCount={}, height={}, movedMembers={}, optimizedInserts={}, maxHashSteps={}, \
             avgHashSteps={}, leafPagesUsed={}%, leafPagesUsedIfSorted={}%, size={}",
            self.pages_count,
            self.height,
            self.moved_members,
            self.optimized_inserts,
            self.max_hash_steps,
            self.avg_hash_steps,
            self.leaf_usage_percent,
            self.leaf_usage_if_sorted_percent,
            self.file_size
        )
    }
}

#[derive(Default)]
struct PageCensus {
    leaves: usize,
    hashed_leaves: usize,
    interior: usize,
    leaf_entries: usize,
}

impl IntToIntBTree {
    /// Counters plus a page-by-page census of the tree
    pub fn statistics(&self) -> Result<TreeStatistics> {
        let mut census = PageCensus::default();
        if let Some(root) = self.core.vars.root {
            self.census(root, &mut census)?;
        }

        let geometry = &self.core.geometry;
        let vars = &self.core.vars;
        let capacity = census.hashed_leaves * geometry.max_leaf_nodes_in_hash as usize
            + (census.leaves - census.hashed_leaves) * geometry.max_leaf_nodes as usize;
        let capacity_if_sorted = census.leaves * geometry.max_leaf_nodes as usize;

        Ok(TreeStatistics {
            pages_count: vars.pages_count,
            height: vars.height,
            entries: self.len(),
            moved_members: vars.moved_members_count,
            optimized_inserts: self.optimized_inserts,
            max_hash_steps: vars.max_steps_searched_in_hash,
            avg_hash_steps: if vars.hash_search_requests != 0 {
                vars.total_hash_steps_searched / vars.hash_search_requests
            } else {
                0
            },
            hashed_pages: vars.hashed_pages_count,
            leaf_pages: census.leaves,
            interior_pages: census.interior,
            leaf_usage_percent: percent(census.leaf_entries, capacity),
            leaf_usage_if_sorted_percent: percent(census.leaf_entries, capacity_if_sorted),
            file_size: self.core.storage.len(),
        })
    }

    fn census(&self, address: PageAddress, census: &mut PageCensus) -> Result<()> {
        let node = NodeView::load(&self.core, address)?;
        if node.is_leaf() {
            census.leaves += 1;
            census.hashed_leaves += usize::from(node.is_hashed());
            census.leaf_entries += node.count();
            return Ok(());
        }

        census.interior += 1;
        for child in node.children(&self.core)? {
            self.census(child, census)?;
        }
        Ok(())
    }

    /// Log the statistics line and return it
    pub fn dump_statistics(&self) -> Result<String> {
        let stats = self.statistics()?;
        let line = stats.to_string();
        tracing::info!(path = %self.path().display(), "{}", line);
        Ok(line)
    }
}

fn percent(used: usize, capacity: usize) -> u32 {
    if capacity == 0 {
        return 0;
    }
    ((used as u64 * 100) / capacity as u64) as u32
}
