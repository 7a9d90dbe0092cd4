//! Root-to-leaf descent
//!
//! With splitting enabled every full node met on the way down is split (or
//! offloaded) before the descent continues, so the leaf reached always has
//! room for one more entry. The ancestor stack lets the descent step back to
//! a parent that filled up from a promoted separator.

use crate::index::node::{NodeView, Probe};
use crate::index::split::{offload_to_siblings, split_node};
use crate::index::state::TreeCore;
use crate::storage::PageAddress;
use crate::Result;

/// Where a key lives or would be inserted
#[derive(Debug, Clone, Copy)]
pub(crate) struct Traversal {
    pub leaf: NodeView,
    pub probe: Probe,
    /// Full nodes seen while descending without splitting
    pub full_pages_along_path: usize,
}

pub(crate) fn locate(core: &mut TreeCore, root: PageAddress, key: i32, allow_split: bool) -> Result<Traversal> {
    let mut ancestors: Vec<NodeView> = Vec::new();
    let mut node = NodeView::load(core, root)?;
    let mut full_pages_along_path = 0;

    loop {
        let depth = ancestors.len() as i32 + 1;
        if depth > core.vars.height.saturating_add(1) {
            return Err(core.corrupted(format!(
                "descent for key {} reached depth {} in a tree of height {}",
                key, depth, core.vars.height
            )));
        }

        if node.is_full(&core.geometry) {
            if allow_split {
                let parent = ancestors.pop();
                if let Some(parent) = parent {
                    if core.config.offload_before_split && offload_to_siblings(core, &mut node, &parent)? {
                        node = parent;
                        continue;
                    }
                }
                node = split_node(core, &mut node, parent)?;
                continue;
            }
            full_pages_along_path += 1;
        }

        let probe = node.search(core, key)?;
        if node.is_leaf() {
            core.vars.height = core.vars.height.max(depth);
            return Ok(Traversal {
                leaf: node,
                probe,
                full_pages_along_path,
            });
        }

        // Keys equal to a separator live in the subtree right of it
        let child = match probe {
            Probe::Found(index) => node.child_at(core, index + 1)?,
            Probe::Vacant(index) => node.child_at(core, index)?,
        };
        ancestors.push(node);
        node = NodeView::load(core, child)?;
    }
}
