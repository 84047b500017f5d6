//! In-memory node representation.
//!
//! A resident node owns its keys and one [`ChildRef`] slot per child. A slot
//! is either a `Stub` carrying only the child's storage identifier (the child
//! is not loaded) or `Resident`, pointing at the child's arena handle. Loading
//! a child promotes its slot from `Stub` to `Resident` in place.
//!
//! Occupancy for order `m`:
//! - a non-root node holds between `m - 1` and `2m - 1` keys
//! - the root holds between 1 and `2m - 1` keys, or 0 when the tree is empty
//! - a node holding `2m` keys is overflown and must be split before the
//!   enclosing operation returns

use std::cmp::Ordering;

use crate::storage::NodeRecord;
use crate::types::{Compare, NodeHandle, NodeId};

/// Whether a resident node differs from its persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The node mirrors its record in storage.
    Clean,
    /// The node was mutated (or never written) since the last save.
    Dirty,
}

/// A child slot of an internal node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildRef {
    /// Child not loaded; only its identifier is known.
    Stub(NodeId),
    /// Child loaded into the arena.
    Resident(NodeHandle),
}

impl ChildRef {
    /// Arena handle of a resident child.
    #[must_use]
    pub const fn handle(&self) -> Option<NodeHandle> {
        match self {
            Self::Resident(handle) => Some(*handle),
            Self::Stub(_) => None,
        }
    }

    #[must_use]
    pub const fn is_resident(&self) -> bool {
        matches!(self, Self::Resident(_))
    }
}

/// Maximum number of keys a node may hold once an operation completed.
#[must_use]
pub const fn max_keys(order: usize) -> usize {
    2 * order - 1
}

/// Minimum number of keys of a non-root node.
#[must_use]
pub const fn min_keys(order: usize) -> usize {
    order - 1
}

/// A resident B-tree node.
#[derive(Debug)]
pub struct Node<K> {
    pub(crate) id: NodeId,
    pub(crate) parent: Option<NodeHandle>,
    pub(crate) keys: Vec<K>,
    pub(crate) children: Vec<ChildRef>,
    pub(crate) state: NodeState,
}

impl<K> Node<K> {
    /// A node created by a structural operation. It has never been written,
    /// so it starts dirty.
    pub(crate) const fn new(
        id: NodeId,
        parent: Option<NodeHandle>,
        keys: Vec<K>,
        children: Vec<ChildRef>,
    ) -> Self {
        Self {
            id,
            parent,
            keys,
            children,
            state: NodeState::Dirty,
        }
    }

    /// A node materialized from its record. Children start as stubs.
    pub(crate) fn from_record(
        id: NodeId,
        parent: Option<NodeHandle>,
        record: NodeRecord<K>,
    ) -> Self {
        Self {
            id,
            parent,
            keys: record.keys,
            children: record.children.into_iter().map(ChildRef::Stub).collect(),
            state: NodeState::Clean,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    #[must_use]
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    #[must_use]
    pub fn children(&self) -> &[ChildRef] {
        &self.children
    }

    #[must_use]
    pub const fn parent(&self) -> Option<NodeHandle> {
        self.parent
    }

    #[must_use]
    pub const fn state(&self) -> NodeState {
        self.state
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state == NodeState::Dirty
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// More than `2m - 1` keys.
    #[must_use]
    pub fn is_overflown(&self, order: usize) -> bool {
        self.keys.len() > max_keys(order)
    }

    /// Fewer keys than allowed: `m - 1` for a non-root node, 1 for the root.
    #[must_use]
    pub fn is_underflown(&self, order: usize) -> bool {
        if self.is_root() {
            self.keys.is_empty()
        } else {
            self.keys.len() < min_keys(order)
        }
    }

    /// Whether giving up one key would leave this node underflown.
    #[must_use]
    pub fn would_underflow(&self, order: usize) -> bool {
        self.keys.len() <= min_keys(order)
    }

    pub(crate) const fn mark_dirty(&mut self) {
        self.state = NodeState::Dirty;
    }

    pub(crate) const fn mark_clean(&mut self) {
        self.state = NodeState::Clean;
    }

    /// Index of a resident child inside `children`.
    pub(crate) fn position_of_child(&self, child: NodeHandle) -> Option<usize> {
        self.children
            .iter()
            .position(|slot| *slot == ChildRef::Resident(child))
    }

    /// Binary search for `key`.
    ///
    /// `Ok(i)` means `keys[i]` equals `key`; `Err(i)` means the key would be
    /// inserted at `i`, which is also the index of the child to descend into.
    pub(crate) fn search<C: Compare<K>>(&self, key: &K, compare: &C) -> Result<usize, usize> {
        self.keys.binary_search_by(|probe| compare.compare(probe, key))
    }

    /// Whether the keys are strictly increasing under `compare`.
    pub(crate) fn keys_sorted<C: Compare<K>>(&self, compare: &C) -> bool {
        self.keys
            .windows(2)
            .all(|pair| compare.compare(&pair[0], &pair[1]) == Ordering::Less)
    }
}
