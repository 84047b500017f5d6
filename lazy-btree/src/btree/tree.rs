//! Disk-backed B-tree of order `m`.
//!
//! Nodes live in an arena keyed by [`NodeHandle`]; only the nodes an
//! operation touched are resident. Every other node is represented by a
//! [`ChildRef::Stub`] slot in its parent and read from storage the first time
//! a descent needs it.
//!
//! After each `insert` and `delete` the tree runs [`Tree::save`], which
//! removes the records of nodes excised from the tree and writes every dirty
//! resident node.

use std::collections::HashMap;
use std::fmt;

use futures::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::btree::error::BTreeError;
use crate::btree::node::{ChildRef, Node};
use crate::config::{TreeConfig, validate_order};
use crate::storage::{FileStore, NodeRecord, NodeStore, StorageError, encode_parts};
use crate::types::{Compare, NaturalOrder, NodeHandle, NodeId};

/// A B-tree whose nodes are persisted as individual records.
///
/// `S` is the storage backend; a tree constructed without one is
/// memory-only and [`Tree::save`] does nothing. `C` is the comparison
/// function.
pub struct Tree<K, S = FileStore, C = NaturalOrder> {
    pub(crate) order: usize,
    pub(crate) compare: C,
    pub(crate) store: Option<S>,
    pub(crate) nodes: HashMap<NodeHandle, Node<K>>,
    next_handle: u64,
    pub(crate) root: ChildRef,
    /// Identifiers of records to delete on the next save.
    pub(crate) pending_deletions: Vec<NodeId>,
}

impl<K, S, C> fmt::Debug for Tree<K, S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("order", &self.order)
            .field("persistent", &self.store.is_some())
            .field("resident", &self.nodes.len())
            .field("root", &self.root)
            .field("pending_deletions", &self.pending_deletions.len())
            .finish_non_exhaustive()
    }
}

impl<K> Tree<K, FileStore, NaturalOrder>
where
    K: Ord + Clone + fmt::Debug + Serialize + DeserializeOwned,
{
    /// Create an empty memory-only tree.
    pub fn in_memory(order: usize) -> Result<Self, BTreeError> {
        Self::with_compare(order, None, NaturalOrder)
    }

    /// Build a tree from configuration.
    ///
    /// With a storage directory the tree is opened on it (existing records
    /// are reused); without one the tree is memory-only.
    pub async fn from_config(config: &TreeConfig) -> Result<Self, BTreeError> {
        config.validate()?;
        match &config.storage_directory {
            Some(directory) => {
                let store = FileStore::open(directory).await?;
                Self::open(config.order, store).await
            }
            None => Self::in_memory(config.order),
        }
    }
}

impl<K, S> Tree<K, S, NaturalOrder>
where
    K: Ord + Clone + fmt::Debug + Serialize + DeserializeOwned,
    S: NodeStore,
{
    /// Open the tree stored in `store`, ordered by `K: Ord`.
    pub async fn open(order: usize, store: S) -> Result<Self, BTreeError> {
        Self::open_with_compare(order, store, NaturalOrder).await
    }
}

impl<K, S, C> Tree<K, S, C>
where
    K: Clone + fmt::Debug + Serialize + DeserializeOwned,
    S: NodeStore,
    C: Compare<K>,
{
    /// Create an empty tree.
    ///
    /// Records already present in `store` are not consulted; the first save
    /// overwrites the root record. Use [`Tree::open_with_compare`] to resume a
    /// persisted tree.
    pub fn with_compare(order: usize, store: Option<S>, compare: C) -> Result<Self, BTreeError> {
        validate_order(order)?;
        let mut tree = Self {
            order,
            compare,
            store,
            nodes: HashMap::new(),
            next_handle: 0,
            root: ChildRef::Stub(NodeId::root()),
            pending_deletions: Vec::new(),
        };
        tree.install_empty_root();
        Ok(tree)
    }

    /// Open the tree persisted in `store`.
    ///
    /// If a root record exists it stays a stub until the first operation
    /// needs it; otherwise the tree starts empty.
    pub async fn open_with_compare(order: usize, store: S, compare: C) -> Result<Self, BTreeError> {
        validate_order(order)?;
        let existing = store.exists(&NodeId::root()).await?;
        let mut tree = Self {
            order,
            compare,
            store: Some(store),
            nodes: HashMap::new(),
            next_handle: 0,
            root: ChildRef::Stub(NodeId::root()),
            pending_deletions: Vec::new(),
        };
        if !existing {
            tree.install_empty_root();
        }
        tracing::info!(order, existing, "opened tree");
        Ok(tree)
    }

    /// Insert `key` and persist the result.
    ///
    /// # Errors
    ///
    /// [`BTreeError::DuplicateKey`] if the key is present; the tree is not
    /// modified in that case.
    pub async fn insert(&mut self, key: K) -> Result<(), BTreeError> {
        let leaf = self.find_leaf(&key).await?;
        self.insert_into(leaf, key).await?;
        self.save().await
    }

    /// Delete `key` and persist the result.
    ///
    /// # Errors
    ///
    /// [`BTreeError::KeyNotFound`] if the key is absent; the tree is not
    /// modified in that case.
    pub async fn delete(&mut self, key: &K) -> Result<(), BTreeError> {
        let holder = self.find_node(key).await?;
        self.delete_from(holder, key).await?;
        self.save().await
    }

    /// Look up `key`, returning the stored key.
    pub async fn find(&mut self, key: &K) -> Result<K, BTreeError> {
        let mut current = self.root_handle().await?;
        loop {
            let node = self.node(current)?;
            match node.search(key, &self.compare) {
                Ok(index) => return Ok(node.keys[index].clone()),
                Err(_) if node.is_leaf() => {
                    return Err(BTreeError::KeyNotFound(format!("{key:?}")));
                }
                Err(index) => current = self.child(current, index).await?,
            }
        }
    }

    /// Whether `key` is present.
    pub async fn contains(&mut self, key: &K) -> Result<bool, BTreeError> {
        match self.find(key).await {
            Ok(_) => Ok(true),
            Err(BTreeError::KeyNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Leaf where `key` belongs.
    ///
    /// Fails with [`BTreeError::DuplicateKey`] as soon as an equal key is seen
    /// on the path, since this descent is only used for insertion.
    pub(crate) async fn find_leaf(&mut self, key: &K) -> Result<NodeHandle, BTreeError> {
        let mut current = self.root_handle().await?;
        loop {
            let node = self.node(current)?;
            match node.search(key, &self.compare) {
                Ok(_) => return Err(BTreeError::DuplicateKey(format!("{key:?}"))),
                Err(_) if node.is_leaf() => return Ok(current),
                Err(index) => current = self.child(current, index).await?,
            }
        }
    }

    /// Node whose key set contains `key`.
    pub(crate) async fn find_node(&mut self, key: &K) -> Result<NodeHandle, BTreeError> {
        let mut current = self.root_handle().await?;
        loop {
            let node = self.node(current)?;
            match node.search(key, &self.compare) {
                Ok(_) => return Ok(current),
                Err(_) if node.is_leaf() => {
                    return Err(BTreeError::KeyNotFound(format!("{key:?}")));
                }
                Err(index) => current = self.child(current, index).await?,
            }
        }
    }

    /// Persist the tree.
    ///
    /// First removes the records of every node scheduled for deletion (the
    /// schedule is cleared only once all removals succeeded), then writes every
    /// dirty resident node, marking each clean once its own write succeeded.
    /// Memory-only trees do nothing.
    pub async fn save(&mut self) -> Result<(), BTreeError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };

        if !self.pending_deletions.is_empty() {
            let results = join_all(
                self.pending_deletions
                    .iter()
                    .map(|id| store.delete_record(id)),
            )
            .await;
            for (id, result) in self.pending_deletions.iter().zip(results) {
                match result {
                    Ok(()) => {}
                    Err(StorageError::NotFound(_)) => {
                        tracing::warn!(%id, "retired record was already absent");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            tracing::debug!(count = self.pending_deletions.len(), "deleted retired records");
            self.pending_deletions.clear();
        }

        let mut writes = Vec::new();
        for (handle, node) in &self.nodes {
            if node.is_dirty() {
                let children = self.child_ids(node)?;
                writes.push((*handle, node.id.clone(), encode_parts(&node.keys, &children)?));
            }
        }
        if writes.is_empty() {
            return Ok(());
        }

        let results = join_all(
            writes
                .iter()
                .map(|(_, id, bytes)| store.write_record(id, bytes)),
        )
        .await;

        let mut first_error = None;
        for ((handle, id, _), result) in writes.iter().zip(results) {
            match result {
                Ok(()) => {
                    if let Some(node) = self.nodes.get_mut(handle) {
                        node.mark_clean();
                    }
                }
                Err(e) => {
                    tracing::warn!(%id, error = %e, "failed to write node record");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => {
                tracing::debug!(count = writes.len(), "wrote dirty nodes");
                Ok(())
            }
        }
    }

    /// Materialize every node of the tree.
    ///
    /// Loads proceed level by level; the reads of one level are issued
    /// concurrently.
    pub async fn load_all(&mut self) -> Result<(), BTreeError> {
        self.root_handle().await?;
        loop {
            let stubs: Vec<(NodeHandle, usize, NodeId)> = self
                .nodes
                .iter()
                .flat_map(|(handle, node)| {
                    node.children
                        .iter()
                        .enumerate()
                        .filter_map(move |(index, slot)| match slot {
                            ChildRef::Stub(id) => Some((*handle, index, id.clone())),
                            ChildRef::Resident(_) => None,
                        })
                })
                .collect();
            if stubs.is_empty() {
                break;
            }

            let store = self.store.as_ref().ok_or(StorageError::NotConfigured)?;
            let reads = join_all(stubs.iter().map(|(_, _, id)| store.read_record(id))).await;
            for ((parent, index, id), bytes) in stubs.into_iter().zip(reads) {
                let record = NodeRecord::decode(&id, &bytes?)?;
                let handle = self.install(Node::from_record(id, Some(parent), record));
                self.node_mut(parent)?.children[index] = ChildRef::Resident(handle);
            }
        }
        tracing::info!(nodes = self.nodes.len(), "loaded full tree");
        Ok(())
    }

    /// Drop every resident node below the root, turning the root's children
    /// back into stubs. Returns the number of nodes dropped.
    ///
    /// Only a persistent tree with nothing left to save can be evicted;
    /// otherwise nothing happens.
    pub fn evict(&mut self) -> usize {
        if self.store.is_none() || !self.pending_deletions.is_empty() || self.dirty_count() > 0 {
            return 0;
        }
        let Some(root) = self.root.handle() else {
            return 0;
        };
        let Some(root_node) = self.nodes.get(&root) else {
            return 0;
        };

        let stubs: Vec<ChildRef> = root_node
            .children
            .iter()
            .map(|slot| match slot {
                ChildRef::Resident(handle) => self
                    .nodes
                    .get(handle)
                    .map_or_else(|| slot.clone(), |child| ChildRef::Stub(child.id.clone())),
                ChildRef::Stub(_) => slot.clone(),
            })
            .collect();
        if stubs.iter().any(ChildRef::is_resident) {
            return 0;
        }

        let before = self.nodes.len();
        self.nodes.retain(|handle, _| *handle == root);
        if let Some(root_node) = self.nodes.get_mut(&root) {
            root_node.children = stubs;
        }
        let evicted = before - self.nodes.len();
        tracing::debug!(evicted, "evicted resident subtrees");
        evicted
    }

    /// Every key in increasing order. Loads the whole tree.
    pub async fn in_order_keys(&mut self) -> Result<Vec<K>, BTreeError> {
        self.load_all().await?;
        let root = self.root_handle().await?;
        let mut keys = Vec::new();
        self.collect_in_order(root, &mut keys)?;
        Ok(keys)
    }

    fn collect_in_order(&self, handle: NodeHandle, out: &mut Vec<K>) -> Result<(), BTreeError> {
        let node = self.node(handle)?;
        if node.is_leaf() {
            out.extend(node.keys.iter().cloned());
            return Ok(());
        }
        for (index, slot) in node.children.iter().enumerate() {
            let child = slot.handle().ok_or_else(|| {
                BTreeError::structural(format!("child {index} of {} is not loaded", node.id))
            })?;
            self.collect_in_order(child, out)?;
            if let Some(key) = node.keys.get(index) {
                out.push(key.clone());
            }
        }
        Ok(())
    }

    /// Number of levels, counting the root. Loads the leftmost path.
    pub async fn height(&mut self) -> Result<usize, BTreeError> {
        let mut current = self.root_handle().await?;
        let mut height = 1;
        while !self.node(current)?.is_leaf() {
            current = self.child(current, 0).await?;
            height += 1;
        }
        Ok(height)
    }

    /// Whether the tree holds no keys.
    pub async fn is_empty(&mut self) -> Result<bool, BTreeError> {
        let root = self.root_handle().await?;
        Ok(self.node(root)?.keys.is_empty())
    }

    /// The branching parameter `m`.
    #[must_use]
    pub const fn order(&self) -> usize {
        self.order
    }

    /// Whether a storage backend is configured.
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    /// The storage backend, if any.
    #[must_use]
    pub const fn store(&self) -> Option<&S> {
        self.store.as_ref()
    }

    /// Consume the tree, returning its storage backend.
    ///
    /// Unsaved changes are dropped.
    #[must_use]
    pub fn into_store(self) -> Option<S> {
        self.store
    }

    /// Number of nodes currently loaded.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of loaded nodes with unsaved changes.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.nodes.values().filter(|node| node.is_dirty()).count()
    }

    /// Identifiers whose records will be deleted by the next save.
    #[must_use]
    pub fn pending_deletions(&self) -> &[NodeId] {
        &self.pending_deletions
    }

    /// Loaded nodes, in no particular order.
    pub fn resident_nodes(&self) -> impl Iterator<Item = &Node<K>> {
        self.nodes.values()
    }

    /// Storage identifier of the root.
    #[must_use]
    pub fn root_id(&self) -> Option<&NodeId> {
        match &self.root {
            ChildRef::Stub(id) => Some(id),
            ChildRef::Resident(handle) => self.nodes.get(handle).map(|node| &node.id),
        }
    }

    /// Keys of the root, if it is loaded.
    #[must_use]
    pub fn root_keys(&self) -> Option<&[K]> {
        self.root
            .handle()
            .and_then(|handle| self.nodes.get(&handle))
            .map(|node| node.keys.as_slice())
    }

    // ========== Arena ==========

    pub(crate) fn node(&self, handle: NodeHandle) -> Result<&Node<K>, BTreeError> {
        self.nodes
            .get(&handle)
            .ok_or_else(|| BTreeError::structural(format!("dangling node handle {handle}")))
    }

    pub(crate) fn node_mut(&mut self, handle: NodeHandle) -> Result<&mut Node<K>, BTreeError> {
        self.nodes
            .get_mut(&handle)
            .ok_or_else(|| BTreeError::structural(format!("dangling node handle {handle}")))
    }

    pub(crate) const fn allocate_handle(&mut self) -> NodeHandle {
        let handle = NodeHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn install(&mut self, node: Node<K>) -> NodeHandle {
        let handle = self.allocate_handle();
        self.nodes.insert(handle, node);
        handle
    }

    fn install_empty_root(&mut self) {
        let handle = self.install(Node::new(NodeId::root(), None, Vec::new(), Vec::new()));
        self.root = ChildRef::Resident(handle);
    }

    /// Storage identifiers of a node's children, resident or not.
    fn child_ids(&self, node: &Node<K>) -> Result<Vec<NodeId>, BTreeError> {
        node.children
            .iter()
            .map(|slot| match slot {
                ChildRef::Stub(id) => Ok(id.clone()),
                ChildRef::Resident(handle) => self.node(*handle).map(|child| child.id.clone()),
            })
            .collect()
    }

    // ========== Lazy loading ==========

    /// Read and decode the record of a node that is not resident.
    async fn fetch(&self, id: &NodeId, parent: Option<NodeHandle>) -> Result<Node<K>, BTreeError> {
        let store = self.store.as_ref().ok_or(StorageError::NotConfigured)?;
        let bytes = store.read_record(id).await?;
        let record = NodeRecord::decode(id, &bytes)?;
        tracing::debug!(%id, keys = record.keys.len(), "loaded node");
        Ok(Node::from_record(id.clone(), parent, record))
    }

    /// Handle of the root, loading it if needed.
    pub(crate) async fn root_handle(&mut self) -> Result<NodeHandle, BTreeError> {
        match &self.root {
            ChildRef::Resident(handle) => Ok(*handle),
            ChildRef::Stub(id) => {
                let id = id.clone();
                let node = self.fetch(&id, None).await?;
                let handle = self.install(node);
                self.root = ChildRef::Resident(handle);
                Ok(handle)
            }
        }
    }

    /// Handle of `parent`'s child at `index`, loading it if needed.
    pub(crate) async fn child(&mut self, parent: NodeHandle, index: usize) -> Result<NodeHandle, BTreeError> {
        let slot = self
            .node(parent)?
            .children
            .get(index)
            .cloned()
            .ok_or_else(|| BTreeError::structural(format!("node {parent} has no child {index}")))?;
        match slot {
            ChildRef::Resident(handle) => Ok(handle),
            ChildRef::Stub(id) => {
                let node = self.fetch(&id, Some(parent)).await?;
                let handle = self.install(node);
                self.node_mut(parent)?.children[index] = ChildRef::Resident(handle);
                Ok(handle)
            }
        }
    }

    pub(crate) async fn last_child(&mut self, parent: NodeHandle) -> Result<NodeHandle, BTreeError> {
        let count = self.node(parent)?.child_count();
        if count == 0 {
            return Err(BTreeError::structural(format!("leaf {parent} has no last child")));
        }
        self.child(parent, count - 1).await
    }

    /// Parent of `handle` and the index of `handle` among its children.
    pub(crate) fn index_in_parent(&self, handle: NodeHandle) -> Result<(NodeHandle, usize), BTreeError> {
        let node = self.node(handle)?;
        let parent = node
            .parent
            .ok_or_else(|| BTreeError::structural(format!("node {} has no parent", node.id)))?;
        let index = self.node(parent)?.position_of_child(handle).ok_or_else(|| {
            BTreeError::structural(format!("node {} is not registered in its parent", node.id))
        })?;
        Ok((parent, index))
    }

    /// Sibling to the left, `None` if `handle` is its parent's first child.
    pub(crate) async fn left_sibling(&mut self, handle: NodeHandle) -> Result<Option<NodeHandle>, BTreeError> {
        let (parent, index) = self.index_in_parent(handle)?;
        if index == 0 {
            return Ok(None);
        }
        self.child(parent, index - 1).await.map(Some)
    }

    /// Sibling to the right, `None` if `handle` is its parent's last child.
    pub(crate) async fn right_sibling(&mut self, handle: NodeHandle) -> Result<Option<NodeHandle>, BTreeError> {
        let (parent, index) = self.index_in_parent(handle)?;
        if index + 1 == self.node(parent)?.child_count() {
            return Ok(None);
        }
        self.child(parent, index + 1).await.map(Some)
    }

    /// Right-most leaf of the subtree rooted at `handle`.
    pub(crate) async fn right_most_leaf(&mut self, handle: NodeHandle) -> Result<NodeHandle, BTreeError> {
        let mut current = handle;
        while !self.node(current)?.is_leaf() {
            current = self.last_child(current).await?;
        }
        Ok(current)
    }

    /// Left-most leaf of the subtree rooted at `handle`.
    pub(crate) async fn left_most_leaf(&mut self, handle: NodeHandle) -> Result<NodeHandle, BTreeError> {
        let mut current = handle;
        while !self.node(current)?.is_leaf() {
            current = self.child(current, 0).await?;
        }
        Ok(current)
    }

    // ========== Identity ==========

    /// Draw an identifier unused by resident nodes, pending deletions,
    /// `reserved`, and (if configured) storage.
    pub(crate) async fn fresh_id(&self, reserved: &[NodeId]) -> Result<NodeId, BTreeError> {
        loop {
            let id = NodeId::random();
            let taken = reserved.contains(&id)
                || self.pending_deletions.contains(&id)
                || self.nodes.values().any(|node| node.id == id);
            if taken {
                continue;
            }
            if let Some(store) = &self.store
                && store.exists(&id).await?
            {
                continue;
            }
            return Ok(id);
        }
    }

    /// Remove a node from the arena and schedule its record for deletion.
    pub(crate) fn retire(&mut self, handle: NodeHandle) -> Result<Node<K>, BTreeError> {
        let node = self
            .nodes
            .remove(&handle)
            .ok_or_else(|| BTreeError::structural(format!("dangling node handle {handle}")))?;
        self.schedule_deletion(node.id.clone());
        Ok(node)
    }

    /// Queue a record for deletion on the next save.
    ///
    /// The root identifier is never queued: whichever node is root next is
    /// written under it. Memory-only trees have nothing to delete.
    fn schedule_deletion(&mut self, id: NodeId) {
        if self.store.is_none() || id.is_root() || self.pending_deletions.contains(&id) {
            return;
        }
        self.pending_deletions.push(id);
    }

    /// Make `handle` the root.
    ///
    /// The node adopts the root identifier and is rewritten under it; its
    /// previous record is scheduled for deletion.
    pub(crate) fn promote_to_root(&mut self, handle: NodeHandle) -> Result<(), BTreeError> {
        let node = self.node_mut(handle)?;
        let previous = std::mem::replace(&mut node.id, NodeId::root());
        node.parent = None;
        node.mark_dirty();
        tracing::debug!(previous = %previous, "promoted node to root");
        self.root = ChildRef::Resident(handle);
        self.schedule_deletion(previous);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{FaultConfig, InvariantChecker, SimulatedStore};
    use crate::testing::{init_tracing, new_test_store};

    async fn persistent_tree(
        order: usize,
        keys: impl IntoIterator<Item = u32>,
    ) -> Tree<u32, SimulatedStore> {
        let mut tree = Tree::open(order, SimulatedStore::new(7))
            .await
            .expect("failed to open tree");
        for key in keys {
            tree.insert(key).await.expect("insert should succeed");
        }
        tree
    }

    fn sim_store(tree: &Tree<u32, SimulatedStore>) -> &SimulatedStore {
        tree.store().expect("tree should be persistent")
    }

    fn record_ids(tree: &Tree<u32, SimulatedStore>) -> Vec<NodeId> {
        sim_store(tree)
            .record_ids()
            .expect("failed to list record ids")
    }

    /// Handle of the resident node holding exactly `keys`.
    fn handle_with_keys(tree: &Tree<u32, SimulatedStore>, keys: &[u32]) -> NodeHandle {
        tree.nodes
            .iter()
            .find(|(_, node)| node.keys() == keys)
            .map(|(handle, _)| *handle)
            .expect("no resident node holds these keys")
    }

    fn assert_valid(tree: &Tree<u32, SimulatedStore>) {
        let mut checker = InvariantChecker::new();
        checker.check_structure(tree, 0);
        checker.check_persisted(tree, &record_ids(tree), 0);
        assert!(!checker.has_violations(), "{:?}", checker.violations());
    }

    #[tokio::test]
    async fn test_sequential_inserts_split_at_median() {
        let mut tree = Tree::in_memory(2).expect("order should be valid");
        for key in 1..=10u32 {
            tree.insert(key).await.expect("insert should succeed");
        }

        assert_eq!(tree.root_keys(), Some(&[4][..]));
        assert_eq!(tree.height().await.expect("failed to compute height"), 3);
        let keys = tree.in_order_keys().await.expect("traversal should succeed");
        assert_eq!(keys, (1..=10).collect::<Vec<_>>());
        for key in 1..=10u32 {
            assert_eq!(tree.find(&key).await.expect("key should be present"), key);
        }
    }

    #[tokio::test]
    async fn test_delete_rebalances_and_collapses_root() {
        init_tracing();
        let mut tree = persistent_tree(2, 1..=10).await;

        tree.delete(&5).await.expect("delete should succeed");
        tree.delete(&7).await.expect("delete should succeed");
        tree.delete(&2).await.expect("delete should succeed");

        for key in [1, 3, 4, 6, 8, 9, 10] {
            let present = tree.contains(&key).await.expect("lookup should succeed");
            assert!(present, "key {key} missing");
        }
        for key in [2, 5, 7] {
            assert!(matches!(tree.find(&key).await, Err(BTreeError::KeyNotFound(_))));
        }
        assert_eq!(tree.root_keys(), Some(&[4, 8][..]));
        assert_eq!(tree.height().await.expect("failed to compute height"), 2);

        tree.load_all().await.expect("full load should succeed");
        assert_valid(&tree);
    }

    #[tokio::test]
    async fn test_delete_takes_replacement_from_fuller_successor_leaf() {
        // ROOT [4] over [2] and [6, 8]; leaves [1] [3] [5] [7] [9, 10]
        let mut tree = persistent_tree(2, 1..=10).await;

        tree.delete(&8).await.expect("delete should succeed");

        let internal = handle_with_keys(&tree, &[6, 9]);
        let leaves: Vec<&[u32]> = tree
            .node(internal)
            .expect("internal node should be resident")
            .children()
            .iter()
            .map(|slot| {
                let handle = slot.handle().expect("child should be resident");
                tree.node(handle).expect("child should be resident").keys()
            })
            .collect();
        assert_eq!(leaves, vec![&[5][..], &[7][..], &[10][..]]);
        assert_valid(&tree);
    }

    #[tokio::test]
    async fn test_internal_rotation_moves_and_reparents_child() {
        init_tracing();
        // ROOT [40] over [20] and [60, 80]; leaves [10] [30] [50] [70] [90, 100]
        let mut tree = persistent_tree(2, (1..=10).map(|k| k * 10)).await;

        // [10] merges with [30], leaving [20]'s node empty; it borrows 40
        // through the root and takes over the leaf [50].
        tree.delete(&10).await.expect("delete should succeed");

        assert_eq!(tree.root_keys(), Some(&[60][..]));
        let left = handle_with_keys(&tree, &[40]);
        let right = handle_with_keys(&tree, &[80]);
        let moved = handle_with_keys(&tree, &[50]);

        let left_node = tree.node(left).expect("left node should be resident");
        assert_eq!(left_node.child_count(), 2);
        assert_eq!(left_node.children()[1], ChildRef::Resident(moved));
        assert_eq!(tree.node(moved).expect("leaf should be resident").parent(), Some(left));
        assert_eq!(tree.node(right).expect("right node should be resident").child_count(), 2);
        assert_valid(&tree);
    }

    #[tokio::test]
    async fn test_leaf_rotation_from_left_sibling() {
        init_tracing();
        let mut tree = persistent_tree(2, (1..=10).map(|k| k * 10)).await;
        tree.insert(55).await.expect("insert should succeed");
        tree.delete(&100).await.expect("delete should succeed");
        // Right internal [60, 80] over [50, 55] [70] [90]

        tree.delete(&70).await.expect("delete should succeed");

        let internal = handle_with_keys(&tree, &[55, 80]);
        let leaves: Vec<&[u32]> = tree
            .node(internal)
            .expect("internal node should be resident")
            .children()
            .iter()
            .map(|slot| {
                let handle = slot.handle().expect("child should be resident");
                tree.node(handle).expect("child should be resident").keys()
            })
            .collect();
        assert_eq!(leaves, vec![&[50][..], &[60][..], &[90][..]]);
        let keys = tree.in_order_keys().await.expect("traversal should succeed");
        assert_eq!(keys, vec![10, 20, 30, 40, 50, 55, 60, 80, 90]);
        assert_valid(&tree);
    }

    #[tokio::test]
    async fn test_duplicate_insert_changes_nothing() {
        let mut tree = persistent_tree(2, 1..=5).await;
        let writes = sim_store(&tree).stats().expect("failed to read stats").writes;

        let result = tree.insert(3).await;
        assert!(matches!(result, Err(BTreeError::DuplicateKey(_))));
        assert_eq!(tree.dirty_count(), 0);
        assert_eq!(sim_store(&tree).stats().expect("failed to read stats").writes, writes);
        let keys = tree.in_order_keys().await.expect("traversal should succeed");
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_delete_missing_key_changes_nothing() {
        let mut tree = persistent_tree(2, 1..=5).await;
        let records = record_ids(&tree);

        let result = tree.delete(&42).await;
        assert!(matches!(result, Err(BTreeError::KeyNotFound(_))));
        assert_eq!(tree.dirty_count(), 0);
        assert!(tree.pending_deletions().is_empty());
        assert_eq!(record_ids(&tree), records);
    }

    #[tokio::test]
    async fn test_save_leaves_nothing_dirty_or_pending() {
        let mut tree = Tree::open(3, SimulatedStore::new(1))
            .await
            .expect("failed to open tree");
        for key in (0..60u32).map(|k| (k * 37) % 61) {
            tree.insert(key).await.expect("insert should succeed");
            assert_eq!(tree.dirty_count(), 0);
            assert!(tree.pending_deletions().is_empty());
        }
        for key in (0..60u32).step_by(3) {
            let key = (key * 37) % 61;
            tree.delete(&key).await.expect("delete should succeed");
            assert_eq!(tree.dirty_count(), 0);
            assert!(tree.pending_deletions().is_empty());
        }
    }

    #[tokio::test]
    async fn test_merge_leaves_no_orphan_record() {
        let mut tree = persistent_tree(2, 1..=4).await;
        // ROOT [2] over leaves [1] and [3, 4]
        assert_eq!(record_ids(&tree).len(), 3);

        tree.delete(&4).await.expect("delete should succeed");
        tree.delete(&1).await.expect("delete should succeed");

        assert_eq!(record_ids(&tree), vec![NodeId::root()]);
        assert_eq!(tree.root_keys(), Some(&[2, 3][..]));
        assert_eq!(tree.resident_count(), 1);
        assert_eq!(tree.height().await.expect("failed to compute height"), 1);
    }

    #[tokio::test]
    async fn test_split_retires_replaced_node() {
        let mut tree = persistent_tree(2, 1..=6).await;
        // ROOT [2, 4] over [1], [3], [5, 6]
        assert_eq!(record_ids(&tree).len(), 4);

        tree.insert(7).await.expect("insert should succeed");
        tree.insert(8).await.expect("insert should succeed");
        // [5, 6, 7, 8] split into two fresh leaves
        assert_eq!(record_ids(&tree).len(), 5);
        tree.load_all().await.expect("full load should succeed");
        assert_valid(&tree);
    }

    #[tokio::test]
    async fn test_reopen_loads_nodes_lazily() {
        let (dir, store) = new_test_store().await.expect("failed to create test store");
        let mut tree = Tree::open(2, store.clone()).await.expect("failed to open tree");
        for key in 1..=40u32 {
            tree.insert(key).await.expect("insert should succeed");
        }
        drop(tree);
        let record_count = std::fs::read_dir(dir.path())
            .expect("failed to read temp dir")
            .count();

        let mut reopened: Tree<u32> = Tree::open(2, store).await.expect("failed to reopen tree");
        assert_eq!(reopened.resident_count(), 0);
        assert_eq!(reopened.root_id(), Some(&NodeId::root()));

        assert_eq!(reopened.find(&17).await.expect("key should be present"), 17);
        assert!(reopened.resident_count() > 0);
        assert!(reopened.resident_count() < record_count);
        assert_eq!(reopened.dirty_count(), 0);

        reopened.load_all().await.expect("full load should succeed");
        assert_eq!(reopened.resident_count(), record_count);
        let keys = reopened.in_order_keys().await.expect("traversal should succeed");
        assert_eq!(keys, (1..=40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_evict_then_find_reloads() {
        let mut tree = persistent_tree(2, 1..=30).await;
        tree.load_all().await.expect("full load should succeed");
        let resident = tree.resident_count();

        assert_eq!(tree.evict(), resident - 1);
        assert_eq!(tree.resident_count(), 1);
        assert_eq!(tree.find(&25).await.expect("key should be present"), 25);
        tree.delete(&25).await.expect("delete should succeed");
        assert!(!tree.contains(&25).await.expect("lookup should succeed"));

        let mut memory = Tree::in_memory(2).expect("order should be valid");
        memory.insert(1u32).await.expect("insert should succeed");
        assert_eq!(memory.evict(), 0);
    }

    #[tokio::test]
    async fn test_memory_tree_never_schedules_deletions() {
        let mut tree = Tree::in_memory(2).expect("order should be valid");
        for key in 1..=20u32 {
            tree.insert(key).await.expect("insert should succeed");
        }
        for key in 1..=15u32 {
            tree.delete(&key).await.expect("delete should succeed");
            assert!(tree.pending_deletions().is_empty());
        }
        assert!(!tree.is_persistent());
        let keys = tree.in_order_keys().await.expect("traversal should succeed");
        assert_eq!(keys, (16..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_delete_everything_leaves_empty_root() {
        let mut tree = persistent_tree(3, 1..=25).await;
        for key in (1..=25u32).rev() {
            tree.delete(&key).await.expect("delete should succeed");
        }
        assert!(tree.is_empty().await.expect("failed to check emptiness"));
        assert_eq!(record_ids(&tree), vec![NodeId::root()]);

        tree.insert(99).await.expect("insert should succeed");
        let keys = tree.in_order_keys().await.expect("traversal should succeed");
        assert_eq!(keys, vec![99]);
    }

    #[tokio::test]
    async fn test_custom_comparator_orders_keys() {
        let mut tree = Tree::with_compare(2, None::<SimulatedStore>, |a: &u32, b: &u32| b.cmp(a))
            .expect("order should be valid");
        for key in 1..=10u32 {
            tree.insert(key).await.expect("insert should succeed");
        }
        let keys = tree.in_order_keys().await.expect("traversal should succeed");
        assert_eq!(keys, (1..=10).rev().collect::<Vec<_>>());
        assert!(matches!(tree.insert(5).await, Err(BTreeError::DuplicateKey(_))));
    }

    #[tokio::test]
    async fn test_invalid_order_is_rejected() {
        assert!(matches!(Tree::<u32>::in_memory(1), Err(BTreeError::Config(_))));
        let result = Tree::<u32, _>::open(0, SimulatedStore::new(1)).await;
        assert!(matches!(result, Err(BTreeError::Config(_))));
    }

    #[tokio::test]
    async fn test_from_config() {
        let memory: Tree<u32> = Tree::from_config(&TreeConfig::memory(3))
            .await
            .expect("config should build a tree");
        assert!(!memory.is_persistent());
        assert_eq!(memory.order(), 3);

        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let config = TreeConfig::on_disk(2, dir.path());
        let mut disk: Tree<u32> = Tree::from_config(&config)
            .await
            .expect("config should build a tree");
        disk.insert(1).await.expect("insert should succeed");
        assert!(dir.path().join(NodeId::ROOT_NAME).exists());
    }

    #[tokio::test]
    async fn test_corrupt_root_record_is_reported() {
        let store = SimulatedStore::new(1);
        store
            .write_record(&NodeId::root(), b"garbage")
            .await
            .expect("write should succeed");

        let mut tree: Tree<u32, _> = Tree::open(2, store).await.expect("failed to open tree");
        let result = tree.find(&1).await;
        assert!(matches!(
            result,
            Err(BTreeError::Storage(StorageError::Corruption { .. }))
        ));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_nodes_dirty() {
        let mut tree = persistent_tree(2, 1..=3).await;
        let failing = FaultConfig {
            write_error_rate: 1.0,
            ..Default::default()
        };
        sim_store(&tree)
            .set_fault_config(failing)
            .expect("failed to set fault config");

        let result = tree.insert(4).await;
        assert!(matches!(
            result,
            Err(BTreeError::Storage(StorageError::InjectedFault(_)))
        ));
        assert!(tree.dirty_count() > 0);
        assert!(tree.contains(&4).await.expect("lookup should succeed"));

        sim_store(&tree)
            .set_fault_config(FaultConfig::no_faults())
            .expect("failed to set fault config");
        tree.save().await.expect("save should succeed");
        assert_eq!(tree.dirty_count(), 0);
        assert!(tree.pending_deletions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_read_during_delete_leaves_tree_unchanged() {
        let tree = persistent_tree(2, 1..=10).await;
        let store = tree.into_store().expect("tree should be persistent");
        let mut tree: Tree<u32, _> = Tree::open(2, store).await.expect("failed to reopen tree");
        // Loads ROOT, its right child and leaf [5] but not the leaf's sibling.
        assert!(tree.contains(&5).await.expect("lookup should succeed"));

        let failing = FaultConfig {
            read_error_rate: 1.0,
            ..Default::default()
        };
        sim_store(&tree)
            .set_fault_config(failing)
            .expect("failed to set fault config");
        let result = tree.delete(&5).await;
        assert!(matches!(result, Err(BTreeError::Storage(_))));
        assert_eq!(tree.dirty_count(), 0);

        sim_store(&tree)
            .set_fault_config(FaultConfig::no_faults())
            .expect("failed to set fault config");
        let keys = tree.in_order_keys().await.expect("traversal should succeed");
        assert_eq!(keys, (1..=10).collect::<Vec<_>>());
        let mut checker = InvariantChecker::new();
        checker.check_structure(&tree, 0);
        assert!(!checker.has_violations(), "{:?}", checker.violations());
    }
}
