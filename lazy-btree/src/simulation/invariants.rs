//! Invariant checking for deterministic simulation testing.
//!
//! This module provides infrastructure for verifying tree invariants after
//! each operation, helping to detect rebalancing bugs and persistence leaks.

// Simulation code legitimately needs cloning for test data
#![allow(clippy::disallowed_methods)]

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::fmt::Debug;

use crate::btree::{ChildRef, Tree, max_keys, min_keys};
use crate::types::{Compare, NodeHandle, NodeId};

/// A recorded operation in the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// An insertion.
    Insert {
        key: u64,
        /// Whether the tree accepted the key.
        success: bool,
        /// Error message if failed.
        error: Option<String>,
    },
    /// A deletion.
    Delete {
        key: u64,
        /// Whether the tree removed the key.
        success: bool,
        /// Error message if failed.
        error: Option<String>,
    },
    /// A lookup.
    Find { key: u64, found: bool },
}

/// Tracks the history of operations and the keys the tree should hold.
#[derive(Debug, Default)]
pub struct OperationHistory {
    /// All operations in order.
    operations: Vec<Operation>,
    /// Keys that were successfully inserted and not deleted since.
    expected_keys: BTreeSet<u64>,
    successful_inserts: u64,
    failed_inserts: u64,
    successful_deletes: u64,
    failed_deletes: u64,
    finds: u64,
}

impl OperationHistory {
    /// Create a new empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an insertion and its outcome.
    pub fn record_insert(&mut self, key: u64, error: Option<String>) {
        let success = error.is_none();
        if success {
            self.successful_inserts += 1;
            self.expected_keys.insert(key);
        } else {
            self.failed_inserts += 1;
        }
        self.operations.push(Operation::Insert {
            key,
            success,
            error,
        });
    }

    /// Record a deletion and its outcome.
    pub fn record_delete(&mut self, key: u64, error: Option<String>) {
        let success = error.is_none();
        if success {
            self.successful_deletes += 1;
            self.expected_keys.remove(&key);
        } else {
            self.failed_deletes += 1;
        }
        self.operations.push(Operation::Delete {
            key,
            success,
            error,
        });
    }

    /// Record a lookup.
    pub fn record_find(&mut self, key: u64, found: bool) {
        self.finds += 1;
        self.operations.push(Operation::Find { key, found });
    }

    /// Get the number of operations.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if history is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// All operations in order.
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Keys the tree is expected to hold.
    #[must_use]
    pub const fn expected_keys(&self) -> &BTreeSet<u64> {
        &self.expected_keys
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            total_operations: self.operations.len(),
            successful_inserts: self.successful_inserts,
            failed_inserts: self.failed_inserts,
            successful_deletes: self.successful_deletes,
            failed_deletes: self.failed_deletes,
            finds: self.finds,
            expected_keys: self.expected_keys.len(),
        }
    }
}

/// Statistics about the operation history.
#[derive(Debug, Clone)]
pub struct HistoryStats {
    /// Total number of operations.
    pub total_operations: usize,
    /// Number of successful insertions.
    pub successful_inserts: u64,
    /// Number of rejected insertions.
    pub failed_inserts: u64,
    /// Number of successful deletions.
    pub successful_deletes: u64,
    /// Number of rejected deletions.
    pub failed_deletes: u64,
    /// Number of lookups.
    pub finds: u64,
    /// Number of keys the tree should hold.
    pub expected_keys: usize,
}

/// An invariant violation detected during simulation.
#[derive(Debug, Clone)]
pub struct InvariantViolation {
    /// Description of the violation.
    pub description: String,
    /// Operation index where it was detected.
    pub operation_index: usize,
    /// Additional context.
    pub context: String,
}

/// Checker for tree invariants.
///
/// The structural checks walk resident nodes only, so callers load the whole
/// tree first (see [`Tree::load_all`]).
pub struct InvariantChecker {
    /// Detected violations.
    violations: Vec<InvariantViolation>,
}

impl Default for InvariantChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantChecker {
    /// Create a new invariant checker.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            violations: Vec::new(),
        }
    }

    /// Get all violations.
    #[must_use]
    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }

    /// Take ownership of the recorded violations.
    #[must_use]
    pub fn into_violations(self) -> Vec<InvariantViolation> {
        self.violations
    }

    /// Check if any violations were detected.
    #[must_use]
    pub const fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    /// Clear all recorded violations.
    pub fn clear(&mut self) {
        self.violations.clear();
    }

    /// Add a violation.
    pub fn add_violation(&mut self, violation: InvariantViolation) {
        self.violations.push(violation);
    }

    fn violation(&mut self, description: &str, operation_index: usize, context: String) {
        self.violations.push(InvariantViolation {
            description: description.to_string(),
            operation_index,
            context,
        });
    }

    /// Check the structure of a fully loaded tree.
    ///
    /// Verifies per-node key order, occupancy bounds, the keys/children shape,
    /// parent links, uniform leaf depth, and strictly increasing in-order keys.
    pub fn check_structure<K, S, C>(&mut self, tree: &Tree<K, S, C>, operation_index: usize)
    where
        K: Debug,
        C: Compare<K>,
    {
        let Some(root) = tree.root.handle() else {
            self.violation("Root is not loaded", operation_index, String::new());
            return;
        };
        let Some(root_node) = tree.nodes.get(&root) else {
            self.violation("Root handle is dangling", operation_index, format!("{root}"));
            return;
        };
        if !root_node.id.is_root() {
            self.violation(
                "Root does not carry the root identifier",
                operation_index,
                format!("id {}", root_node.id),
            );
        }
        if root_node.parent.is_some() {
            self.violation("Root has a parent", operation_index, String::new());
        }

        let mut leaf_depths = BTreeSet::new();
        let mut in_order = Vec::new();
        let mut seen = HashSet::new();
        self.walk(
            tree,
            root,
            0,
            operation_index,
            &mut leaf_depths,
            &mut in_order,
            &mut seen,
        );

        if leaf_depths.len() > 1 {
            self.violation(
                "Leaves at different depths",
                operation_index,
                format!("depths {leaf_depths:?}"),
            );
        }
        if let Some(pair) = in_order
            .windows(2)
            .find(|pair| tree.compare.compare(pair[0], pair[1]) != Ordering::Less)
        {
            self.violation(
                "In-order keys not strictly increasing",
                operation_index,
                format!("{:?} followed by {:?}", pair[0], pair[1]),
            );
        }
        if seen.len() != tree.nodes.len() {
            self.violation(
                "Resident nodes unreachable from the root",
                operation_index,
                format!("{} reachable of {} resident", seen.len(), tree.nodes.len()),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn walk<'t, K, S, C>(
        &mut self,
        tree: &'t Tree<K, S, C>,
        handle: NodeHandle,
        depth: usize,
        operation_index: usize,
        leaf_depths: &mut BTreeSet<usize>,
        in_order: &mut Vec<&'t K>,
        seen: &mut HashSet<NodeHandle>,
    ) where
        K: Debug,
        C: Compare<K>,
    {
        let Some(node) = tree.nodes.get(&handle) else {
            self.violation("Dangling child handle", operation_index, format!("{handle}"));
            return;
        };
        if !seen.insert(handle) {
            self.violation("Node reachable twice", operation_index, format!("{}", node.id));
            return;
        }

        let order = tree.order;
        if !node.keys_sorted(&tree.compare) {
            self.violation(
                "Node keys not strictly increasing",
                operation_index,
                format!("node {} keys {:?}", node.id, node.keys),
            );
        }
        if node.key_count() > max_keys(order) {
            self.violation(
                "Node overflown",
                operation_index,
                format!("node {} holds {} keys", node.id, node.key_count()),
            );
        }
        let too_few = if node.is_root() {
            !node.is_leaf() && node.keys.is_empty()
        } else {
            node.key_count() < min_keys(order)
        };
        if too_few {
            self.violation(
                "Node underflown",
                operation_index,
                format!("node {} holds {} keys", node.id, node.key_count()),
            );
        }
        if !node.is_leaf() && node.child_count() != node.key_count() + 1 {
            self.violation(
                "Child count does not match key count",
                operation_index,
                format!(
                    "node {} has {} keys and {} children",
                    node.id,
                    node.key_count(),
                    node.child_count()
                ),
            );
        }

        if node.is_leaf() {
            leaf_depths.insert(depth);
            in_order.extend(node.keys.iter());
            return;
        }

        for (index, slot) in node.children.iter().enumerate() {
            let ChildRef::Resident(child) = slot else {
                self.violation(
                    "Child not loaded",
                    operation_index,
                    format!("child {index} of node {}", node.id),
                );
                continue;
            };
            if let Some(child_node) = tree.nodes.get(child)
                && child_node.parent != Some(handle)
            {
                self.violation(
                    "Child parent link is wrong",
                    operation_index,
                    format!("child {} of node {}", child_node.id, node.id),
                );
            }
            self.walk(
                tree,
                *child,
                depth + 1,
                operation_index,
                leaf_depths,
                in_order,
                seen,
            );
            if let Some(key) = node.keys.get(index) {
                in_order.push(key);
            }
        }
    }

    /// Check that the tree holds exactly the expected keys.
    pub fn check_contents(&mut self, actual: &[u64], expected: &BTreeSet<u64>, operation_index: usize) {
        if actual.len() != expected.len() || !actual.iter().eq(expected.iter()) {
            let missing: Vec<&u64> = expected.iter().filter(|k| !actual.contains(*k)).collect();
            let unexpected: Vec<&u64> = actual.iter().filter(|k| !expected.contains(*k)).collect();
            self.violation(
                "Tree contents differ from model",
                operation_index,
                format!("missing {missing:?}, unexpected {unexpected:?}"),
            );
        }
    }

    /// Check persistence bookkeeping after a successful save on a fully
    /// loaded tree: nothing dirty, nothing pending, and exactly one record
    /// per node.
    pub fn check_persisted<K, S, C>(&mut self, tree: &Tree<K, S, C>, record_ids: &[NodeId], operation_index: usize) {
        let dirty = tree.nodes.values().filter(|node| node.is_dirty()).count();
        if dirty > 0 {
            self.violation(
                "Dirty nodes after save",
                operation_index,
                format!("{dirty} dirty"),
            );
        }
        if !tree.pending_deletions.is_empty() {
            self.violation(
                "Pending deletions after save",
                operation_index,
                format!("{:?}", tree.pending_deletions),
            );
        }

        let stored: HashSet<&NodeId> = record_ids.iter().collect();
        let resident: HashSet<&NodeId> = tree.nodes.values().map(|node| &node.id).collect();
        let orphans: Vec<&&NodeId> = stored.difference(&resident).collect();
        if !orphans.is_empty() {
            self.violation(
                "Orphaned records in storage",
                operation_index,
                format!("{orphans:?}"),
            );
        }
        let missing: Vec<&&NodeId> = resident.difference(&stored).collect();
        if !missing.is_empty() {
            self.violation(
                "Nodes without a record",
                operation_index,
                format!("{missing:?}"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedStore;

    #[test]
    fn test_operation_history_tracks_expected_keys() {
        let mut history = OperationHistory::new();
        history.record_insert(3, None);
        history.record_insert(5, None);
        history.record_insert(3, Some("duplicate".to_string()));
        history.record_delete(5, None);
        history.record_delete(9, Some("not found".to_string()));
        history.record_find(3, true);

        assert_eq!(history.len(), 6);
        assert_eq!(history.expected_keys().iter().copied().collect::<Vec<_>>(), vec![3]);

        let stats = history.stats();
        assert_eq!(stats.successful_inserts, 2);
        assert_eq!(stats.failed_inserts, 1);
        assert_eq!(stats.successful_deletes, 1);
        assert_eq!(stats.failed_deletes, 1);
        assert_eq!(stats.finds, 1);
    }

    #[tokio::test]
    async fn test_checker_accepts_valid_tree() {
        let mut tree = Tree::open(2, SimulatedStore::new(1)).await.expect("tree should open");
        for key in 1..=20u64 {
            tree.insert(key).await.expect("insert should succeed");
        }
        tree.load_all().await.expect("full load should succeed");

        let mut checker = InvariantChecker::new();
        checker.check_structure(&tree, 0);
        let ids = tree.store().expect("tree should be persistent").record_ids().expect("record ids should be listable");
        checker.check_persisted(&tree, &ids, 0);
        let keys = tree.in_order_keys().await.expect("traversal should succeed");
        checker.check_contents(&keys, &(1..=20).collect(), 0);

        assert!(!checker.has_violations(), "{:?}", checker.violations());
    }

    #[tokio::test]
    async fn test_checker_detects_orphaned_record() {
        let mut tree = Tree::open(2, SimulatedStore::new(1)).await.expect("tree should open");
        tree.insert(1u64).await.expect("insert should succeed");

        let mut ids = tree.store().expect("tree should be persistent").record_ids().expect("record ids should be listable");
        ids.push(NodeId::random());

        let mut checker = InvariantChecker::new();
        checker.check_persisted(&tree, &ids, 4);
        assert_eq!(checker.violations().len(), 1);
        assert_eq!(checker.violations()[0].description, "Orphaned records in storage");
        assert_eq!(checker.violations()[0].operation_index, 4);
    }

    #[test]
    fn test_checker_detects_content_mismatch() {
        let mut checker = InvariantChecker::new();
        checker.check_contents(&[1, 2], &[1, 3].into_iter().collect(), 0);
        assert!(checker.has_violations());
        assert!(checker.violations()[0].context.contains("missing [3]"));
    }
}
