//! Structural maintenance: overflow splits and underflow resolution.
//!
//! After an insertion, an overflown node is split around its median and the
//! median moves into the parent, repeating upward while the parent overflows.
//! After a deletion, an underflown node first tries to borrow through the
//! parent from its right sibling, then from its left sibling, and otherwise
//! merges with a sibling, repeating upward while the parent underflows.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::btree::error::BTreeError;
use crate::btree::node::{ChildRef, Node};
use crate::btree::tree::Tree;
use crate::storage::NodeStore;
use crate::types::{Compare, NodeHandle, NodeId};

impl<K, S, C> Tree<K, S, C>
where
    K: Clone + fmt::Debug + Serialize + DeserializeOwned,
    S: NodeStore,
    C: Compare<K>,
{
    /// Insert `key` into `leaf`, then split upward while nodes overflow.
    pub(crate) async fn insert_into(&mut self, leaf: NodeHandle, key: K) -> Result<(), BTreeError> {
        let index = match self.node(leaf)?.search(&key, &self.compare) {
            Ok(_) => return Err(BTreeError::DuplicateKey(format!("{key:?}"))),
            Err(index) => index,
        };
        let node = self.node_mut(leaf)?;
        node.keys.insert(index, key);
        node.mark_dirty();

        let mut current = leaf;
        while self.node(current)?.is_overflown(self.order) {
            current = self.split(current).await?;
        }
        Ok(())
    }

    /// Split an overflown node into two fresh siblings.
    ///
    /// The median moves into the parent, or into a new root when the node was
    /// the root. Returns the node that received the median.
    pub(crate) async fn split(&mut self, handle: NodeHandle) -> Result<NodeHandle, BTreeError> {
        let order = self.order;
        let node = self.node(handle)?;
        if !node.is_overflown(order) {
            return Err(BTreeError::structural(format!(
                "split of node {} holding {} keys",
                node.id,
                node.key_count()
            )));
        }
        let parent = node.parent;
        let slot = match parent {
            Some(p) => Some(self.node(p)?.position_of_child(handle).ok_or_else(|| {
                BTreeError::structural(format!("node {} is not registered in its parent", node.id))
            })?),
            None => None,
        };

        // Identifiers first: a storage failure here leaves the tree untouched.
        let left_id = self.fresh_id(&[]).await?;
        let right_id = self.fresh_id(std::slice::from_ref(&left_id)).await?;

        let mut node = self.retire(handle)?;
        let right_keys = node.keys.split_off(order);
        let median = node
            .keys
            .pop()
            .ok_or_else(|| BTreeError::structural("split found no median key"))?;
        let right_children = if node.children.is_empty() {
            Vec::new()
        } else {
            node.children.split_off(order)
        };

        tracing::debug!(node = %node.id, left = %left_id, right = %right_id, "splitting node");

        let target = match parent {
            Some(p) => p,
            None => self.allocate_handle(),
        };
        let left = self.allocate_handle();
        let right = self.allocate_handle();
        self.nodes.insert(left, Node::new(left_id, Some(target), node.keys, node.children));
        self.nodes.insert(right, Node::new(right_id, Some(target), right_keys, right_children));
        self.adopt(left)?;
        self.adopt(right)?;

        match slot {
            Some(index) => {
                let parent = self.node_mut(target)?;
                parent
                    .children
                    .splice(index..=index, [ChildRef::Resident(left), ChildRef::Resident(right)]);
                parent.keys.insert(index, median);
                parent.mark_dirty();
                tracing::debug!(parent = %parent.id, "median moved into parent");
            }
            None => {
                let root = Node::new(
                    NodeId::root(),
                    None,
                    vec![median],
                    vec![ChildRef::Resident(left), ChildRef::Resident(right)],
                );
                self.nodes.insert(target, root);
                self.root = ChildRef::Resident(target);
                tracing::debug!("root split, tree grew one level");
            }
        }
        Ok(target)
    }

    /// Remove `key` from `holder`, the node that contains it.
    ///
    /// An internal holder takes a replacement from the rightmost leaf of its
    /// left subtree or the leftmost leaf of its right subtree, whichever holds
    /// more keys (the left one on a tie); the key leaves through that leaf.
    pub(crate) async fn delete_from(&mut self, holder: NodeHandle, key: &K) -> Result<(), BTreeError> {
        let Ok(index) = self.node(holder)?.search(key, &self.compare) else {
            return Err(BTreeError::KeyNotFound(format!("{key:?}")));
        };

        if self.node(holder)?.is_leaf() {
            self.prefetch_rebalance_path(holder).await?;
            let node = self.node_mut(holder)?;
            node.keys.remove(index);
            node.mark_dirty();
            return self.resolve_underflow(holder).await;
        }

        let left = self.child(holder, index).await?;
        let predecessor = self.right_most_leaf(left).await?;
        let right = self.child(holder, index + 1).await?;
        let successor = self.left_most_leaf(right).await?;

        let donor = if self.node(predecessor)?.key_count() >= self.node(successor)?.key_count() {
            predecessor
        } else {
            successor
        };
        self.prefetch_rebalance_path(donor).await?;

        let replacement = if donor == predecessor {
            let leaf = self.node_mut(predecessor)?;
            let replacement = leaf
                .keys
                .pop()
                .ok_or_else(|| BTreeError::structural("predecessor leaf is empty"))?;
            leaf.mark_dirty();
            replacement
        } else {
            let leaf = self.node_mut(successor)?;
            if leaf.keys.is_empty() {
                return Err(BTreeError::structural("successor leaf is empty"));
            }
            let replacement = leaf.keys.remove(0);
            leaf.mark_dirty();
            replacement
        };

        let node = self.node_mut(holder)?;
        node.keys[index] = replacement;
        node.mark_dirty();
        self.resolve_underflow(donor).await
    }

    /// Load every sibling that rebalancing after removing one key from
    /// `handle` may consult.
    ///
    /// Walks upward while the current node is at minimum occupancy, since only
    /// then can the removal propagate past it. All reads happen here, before
    /// the removal, so a failed read leaves the tree untouched.
    async fn prefetch_rebalance_path(&mut self, handle: NodeHandle) -> Result<(), BTreeError> {
        let order = self.order;
        let mut current = handle;
        loop {
            let node = self.node(current)?;
            let Some(parent) = node.parent else {
                return Ok(());
            };
            if !node.would_underflow(order) {
                return Ok(());
            }
            self.right_sibling(current).await?;
            self.left_sibling(current).await?;
            current = parent;
        }
    }

    /// Rebalance from `handle` upward until no node underflows.
    async fn resolve_underflow(&mut self, handle: NodeHandle) -> Result<(), BTreeError> {
        let mut current = Some(handle);
        while let Some(node) = current {
            if !self.node(node)?.is_underflown(self.order) {
                break;
            }
            current = self.rebalance(node).await?;
        }
        Ok(())
    }

    /// One rebalancing step. Returns the parent when a merge may have left
    /// it underflown.
    async fn rebalance(&mut self, handle: NodeHandle) -> Result<Option<NodeHandle>, BTreeError> {
        if self.node(handle)?.is_root() {
            self.collapse_root(handle).await?;
            return Ok(None);
        }

        let order = self.order;
        let right = self.right_sibling(handle).await?;
        if let Some(sibling) = right
            && !self.node(sibling)?.would_underflow(order)
        {
            self.rotate_left(handle, sibling)?;
            return Ok(None);
        }

        let left = self.left_sibling(handle).await?;
        if let Some(sibling) = left
            && !self.node(sibling)?.would_underflow(order)
        {
            self.rotate_right(handle, sibling)?;
            return Ok(None);
        }

        match (right, left) {
            (Some(sibling), _) => self.merge_right(handle, sibling).map(Some),
            (None, Some(sibling)) => self.merge_left(handle, sibling).map(Some),
            (None, None) => Err(BTreeError::structural(format!(
                "underflown node {} has no siblings",
                self.node(handle)?.id
            ))),
        }
    }

    /// Handle an empty root: an empty leaf is an empty tree, an empty internal
    /// root hands the root role to its only child.
    async fn collapse_root(&mut self, root: NodeHandle) -> Result<(), BTreeError> {
        let node = self.node(root)?;
        if node.is_leaf() {
            return Ok(());
        }
        if node.child_count() != 1 {
            return Err(BTreeError::structural(format!(
                "empty root has {} children",
                node.child_count()
            )));
        }
        let child = self.child(root, 0).await?;
        self.nodes.remove(&root);
        self.promote_to_root(child)?;
        tracing::debug!("root collapsed, tree shrank one level");
        Ok(())
    }

    /// Move the separator after `handle` down into it and the right
    /// sibling's first key up into the parent.
    fn rotate_left(&mut self, handle: NodeHandle, sibling: NodeHandle) -> Result<(), BTreeError> {
        let (parent, index) = self.index_in_parent(handle)?;

        let donor = self.node_mut(sibling)?;
        if donor.keys.is_empty() {
            return Err(BTreeError::structural("rotation from an empty sibling"));
        }
        let raised = donor.keys.remove(0);
        let moved = if donor.is_leaf() {
            None
        } else {
            Some(donor.children.remove(0))
        };
        donor.mark_dirty();

        let parent_node = self.node_mut(parent)?;
        let separator = std::mem::replace(&mut parent_node.keys[index], raised);
        parent_node.mark_dirty();

        let node = self.node_mut(handle)?;
        node.keys.push(separator);
        if let Some(child) = &moved {
            node.children.push(child.clone());
        }
        node.mark_dirty();

        if let Some(ChildRef::Resident(child)) = moved {
            self.node_mut(child)?.parent = Some(handle);
        }
        tracing::debug!(
            node = %self.node(handle)?.id,
            sibling = %self.node(sibling)?.id,
            parent = %self.node(parent)?.id,
            "rotated key from right sibling"
        );
        Ok(())
    }

    /// Move the separator before `handle` down into it and the left
    /// sibling's last key up into the parent.
    fn rotate_right(&mut self, handle: NodeHandle, sibling: NodeHandle) -> Result<(), BTreeError> {
        let (parent, index) = self.index_in_parent(handle)?;
        if index == 0 {
            return Err(BTreeError::structural("rotate right on a first child"));
        }

        let donor = self.node_mut(sibling)?;
        let raised = donor
            .keys
            .pop()
            .ok_or_else(|| BTreeError::structural("rotation from an empty sibling"))?;
        let moved = donor.children.pop();
        donor.mark_dirty();

        let parent_node = self.node_mut(parent)?;
        let separator = std::mem::replace(&mut parent_node.keys[index - 1], raised);
        parent_node.mark_dirty();

        let node = self.node_mut(handle)?;
        node.keys.insert(0, separator);
        if let Some(child) = &moved {
            node.children.insert(0, child.clone());
        }
        node.mark_dirty();

        if let Some(ChildRef::Resident(child)) = moved {
            self.node_mut(child)?.parent = Some(handle);
        }
        tracing::debug!(
            node = %self.node(handle)?.id,
            sibling = %self.node(sibling)?.id,
            parent = %self.node(parent)?.id,
            "rotated key from left sibling"
        );
        Ok(())
    }

    /// Absorb the separator and the right sibling into `handle`.
    fn merge_right(&mut self, handle: NodeHandle, sibling: NodeHandle) -> Result<NodeHandle, BTreeError> {
        let (parent, index) = self.index_in_parent(handle)?;
        if self.node(parent)?.children.get(index + 1) != Some(&ChildRef::Resident(sibling)) {
            return Err(BTreeError::structural("merge with a node that is not the right sibling"));
        }

        let absorbed = self.retire(sibling)?;
        let parent_node = self.node_mut(parent)?;
        let separator = parent_node.keys.remove(index);
        parent_node.children.remove(index + 1);
        parent_node.mark_dirty();

        let node = self.node_mut(handle)?;
        node.keys.push(separator);
        node.keys.extend(absorbed.keys);
        node.children.extend(absorbed.children);
        node.mark_dirty();
        self.adopt(handle)?;
        tracing::debug!(
            node = %self.node(handle)?.id,
            absorbed = %absorbed.id,
            parent = %self.node(parent)?.id,
            "merged right sibling"
        );
        Ok(parent)
    }

    /// Absorb the left sibling and the separator into `handle`, prepending.
    fn merge_left(&mut self, handle: NodeHandle, sibling: NodeHandle) -> Result<NodeHandle, BTreeError> {
        let (parent, index) = self.index_in_parent(handle)?;
        if index == 0 || self.node(parent)?.children.get(index - 1) != Some(&ChildRef::Resident(sibling)) {
            return Err(BTreeError::structural("merge with a node that is not the left sibling"));
        }

        let absorbed = self.retire(sibling)?;
        let parent_node = self.node_mut(parent)?;
        let separator = parent_node.keys.remove(index - 1);
        parent_node.children.remove(index - 1);
        parent_node.mark_dirty();

        let node = self.node_mut(handle)?;
        let mut keys = absorbed.keys;
        keys.push(separator);
        keys.append(&mut node.keys);
        node.keys = keys;
        let mut children = absorbed.children;
        children.append(&mut node.children);
        node.children = children;
        node.mark_dirty();
        self.adopt(handle)?;
        tracing::debug!(
            node = %self.node(handle)?.id,
            absorbed = %absorbed.id,
            parent = %self.node(parent)?.id,
            "merged left sibling"
        );
        Ok(parent)
    }

    /// Point the parent link of every resident child of `handle` at it.
    fn adopt(&mut self, handle: NodeHandle) -> Result<(), BTreeError> {
        let children: Vec<NodeHandle> = self
            .node(handle)?
            .children
            .iter()
            .filter_map(ChildRef::handle)
            .collect();
        for child in children {
            self.node_mut(child)?.parent = Some(handle);
        }
        Ok(())
    }
}
