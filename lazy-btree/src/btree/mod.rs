//! Disk-backed B-tree with lazily loaded nodes.
//!
//! # Structure
//!
//! A tree of order `m` keeps every non-root node between `m - 1` and `2m - 1`
//! keys; all leaves sit at the same depth. Each node is persisted as its own
//! record (see [`crate::storage`]), the root always under `ROOT`. Internal
//! nodes reference their children by identifier only, so a tree can be opened
//! without reading more than the root.
//!
//! # Usage
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # tokio::runtime::Runtime::new()?.block_on(async {
//! use lazy_btree::btree::Tree;
//!
//! let mut tree = Tree::in_memory(2)?;
//! for key in 1..=10 {
//!     tree.insert(key).await?;
//! }
//! assert_eq!(tree.root_keys(), Some(&[4][..]));
//! tree.delete(&4).await?;
//! assert!(!tree.contains(&4).await?);
//! # Ok::<(), lazy_btree::btree::BTreeError>(())
//! # })?;
//! # Ok(())
//! # }
//! ```

mod error;
mod node;
mod rebalance;
mod tree;

pub use error::BTreeError;
pub use node::{ChildRef, Node, NodeState, max_keys, min_keys};
pub use tree::Tree;
