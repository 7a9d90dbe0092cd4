//! Index layer implementation
//!
//! An int-to-int B-tree whose nodes are pages of a [`PagedFile`](crate::storage::PagedFile).

pub mod btree;
pub mod layout;
pub(crate) mod node;
pub(crate) mod split;
pub mod state;
pub mod stats;
pub(crate) mod traversal;

pub use btree::IntToIntBTree;
pub use layout::NodeGeometry;
pub use split::MIN_ITEMS_TO_SHARE;
pub use state::TreeVars;
pub use stats::TreeStatistics;
