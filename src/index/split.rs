//! Node splitting and sibling offloading
//!
//! Both run during a descent with insertion enabled, on a node that is full
//! before the key is placed. A split always leaves room in both halves and
//! pushes one separator into the parent (or a new root); an offload moves
//! leaf entries sideways and leaves the parent's shape untouched.

use crate::index::layout::{NodeGeometry, KEY_OFFSET};
use crate::index::node::{NodeView, Slot};
use crate::index::state::TreeCore;
use crate::storage::{PageAddress, PageBytes};
use crate::Result;

/// Hashed siblings must be able to take more than this many entries
pub const MIN_ITEMS_TO_SHARE: usize = 20;

/// Split a full node and return the node the descent resumes at
///
/// With a parent the separator is inserted there and the parent is returned.
/// Without one a new root is allocated above the two halves.
pub(crate) fn split_node(core: &mut TreeCore, node: &mut NodeView, parent: Option<NodeView>) -> Result<NodeView> {
    node.dump(core, "before split");

    let sibling_address = core.allocate_page()?;
    let mut sibling = NodeView::init(core, sibling_address, node.is_leaf())?;

    let median = if node.is_hashed() {
        let entries = node.sorted_entries(core)?;
        let mid = entries.len() / 2;
        let median = entries[mid].0;
        node.rebuild_leaf(core, &entries[..mid])?;
        for &(key, value) in &entries[mid..] {
            sibling.insert(core, key, Slot::Value(value))?;
        }
        median
    } else {
        move_upper_half(core, node, &mut sibling)?
    };

    let next = node.next_page(core)?;
    sibling.set_next_page(core, next)?;
    node.set_next_page(core, Some(sibling_address))?;

    if core.config.sanity_check {
        node.check_invariants(core)?;
        sibling.check_invariants(core)?;
    }
    node.dump(core, "split left");
    sibling.dump(core, "split right");

    match parent {
        Some(mut parent) => {
            parent.insert(core, median, Slot::Child(sibling_address))?;
            Ok(parent)
        }
        None => grow_root(core, node.address(), median, sibling_address),
    }
}

/// Sorted leaves and interior nodes: copy the upper half verbatim
///
/// Returns the separator. For a leaf it is the first key of the new page;
/// an interior node gives up its middle key, which moves to the parent.
fn move_upper_half(core: &mut TreeCore, node: &mut NodeView, sibling: &mut NodeView) -> Result<i32> {
    let record_count = node.count();
    let leaf = node.is_leaf();
    let half = if leaf { record_count / 2 } else { (record_count + 1) / 2 };

    // Interior nodes carry their rightmost child, the value word after the last key
    let start = NodeGeometry::slot_offset(half);
    let end = NodeGeometry::slot_offset(record_count) + if leaf { 0 } else { KEY_OFFSET };
    let tail = core.storage.page(node.address())?.bytes()[start..end].to_vec();

    let dest = NodeGeometry::slot_offset(0);
    core.storage.page_mut(sibling.address())?.bytes_mut()[dest..dest + tail.len()].copy_from_slice(&tail);
    sibling.set_count(core, record_count - half)?;

    if leaf {
        node.set_count(core, half)?;
        sibling.key_at(core, 0)
    } else {
        let median = node.key_at(core, half - 1)?;
        node.set_count(core, half - 1)?;
        Ok(median)
    }
}

fn grow_root(core: &mut TreeCore, left: PageAddress, median: i32, right: PageAddress) -> Result<NodeView> {
    let address = core.allocate_page()?;
    let mut root = NodeView::init(core, address, false)?;
    root.set_slot_at(core, 0, Slot::Child(left))?;
    root.set_key_at(core, 0, median)?;
    root.set_slot_at(core, 1, Slot::Child(right))?;
    root.set_count(core, 1)?;

    core.vars.root = Some(address);
    core.vars.height += 1;
    tracing::debug!(root = %address, height = core.vars.height, "root split");
    Ok(root)
}

/// Try to make room in a full leaf by moving entries into a neighbour
///
/// The left neighbour takes the smallest keys, the right neighbour the
/// largest. Returns true when the leaf is no longer full.
pub(crate) fn offload_to_siblings(core: &mut TreeCore, node: &mut NodeView, parent: &NodeView) -> Result<bool> {
    if !node.is_leaf() {
        return Ok(false);
    }

    let children = parent.children(core)?;
    let position = match children.iter().position(|&child| child == node.address()) {
        Some(position) => position,
        None => {
            return Err(core.corrupted(format!(
                "page {} is not a child of its parent {}",
                node.address(),
                parent.address()
            )))
        }
    };

    if position > 0 {
        let mut left = NodeView::load(core, children[position - 1])?;
        let to_move = shareable(core, &left);
        if to_move > 0 {
            node.dump(core, "before offload left");
            let entries = node.sorted_entries(core)?;
            let to_move = to_move.min(entries.len() - 1);
            for &(key, value) in &entries[..to_move] {
                left.insert(core, key, Slot::Value(value))?;
            }
            parent.set_key_at(core, position - 1, entries[to_move].0)?;
            node.rebuild_leaf(core, &entries[to_move..])?;
            tracing::trace!(page = %node.address(), sibling = %left.address(), moved = to_move, "offloaded to left sibling");
            return Ok(!node.is_full(&core.geometry));
        }
    }

    if position < parent.count() {
        let mut right = NodeView::load(core, children[position + 1])?;
        let to_move = shareable(core, &right);
        if to_move > 0 {
            node.dump(core, "before offload right");
            let entries = node.sorted_entries(core)?;
            let keep = entries.len() - to_move.min(entries.len() - 1);
            for &(key, value) in &entries[keep..] {
                right.insert(core, key, Slot::Value(value))?;
            }
            parent.set_key_at(core, position, entries[keep].0)?;
            node.rebuild_leaf(core, &entries[..keep])?;
            tracing::trace!(
                page = %node.address(),
                sibling = %right.address(),
                moved = entries.len() - keep,
                "offloaded to right sibling"
            );
            return Ok(!node.is_full(&core.geometry));
        }
    }

    Ok(false)
}

/// Entries a sibling leaf can take without becoming crowded, or 0
fn shareable(core: &TreeCore, sibling: &NodeView) -> usize {
    // An empty leaf turns hashed at its first insert
    let hashed = sibling.is_hashed() || (sibling.count() == 0 && core.geometry.hashed_leaves);
    let max = if hashed {
        core.geometry.max_leaf_nodes_in_hash as usize
    } else {
        core.geometry.max_leaf_nodes as usize
    };
    let to_move = max.saturating_sub(sibling.count()) / 2;
    let threshold = if hashed { MIN_ITEMS_TO_SHARE + 1 } else { 1 };
    if to_move >= threshold {
        to_move
    } else {
        0
    }
}
