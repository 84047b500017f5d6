//! Error taxonomy of tree operations.

use crate::config::ConfigError;
use crate::storage::StorageError;

/// Errors returned by [`Tree`](crate::btree::Tree) operations.
///
/// `DuplicateKey` and `KeyNotFound` are detected before any mutation, so the
/// tree is unchanged when they are returned. `StructuralInvariant` means an
/// earlier bug left the tree in a shape the algorithms cannot repair.
#[derive(Debug)]
pub enum BTreeError {
    /// The key being inserted is already present.
    DuplicateKey(String),
    /// The key being looked up or deleted is not present.
    KeyNotFound(String),
    /// The tree violates a structural invariant.
    StructuralInvariant(String),
    /// The storage backend failed.
    Storage(StorageError),
    /// The tree configuration is invalid.
    Config(ConfigError),
}

impl BTreeError {
    pub(crate) fn structural(message: impl Into<String>) -> Self {
        Self::StructuralInvariant(message.into())
    }
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateKey(key) => write!(f, "key {key} already exists in this tree"),
            Self::KeyNotFound(key) => write!(f, "key {key} not found"),
            Self::StructuralInvariant(msg) => write!(f, "structural invariant violated: {msg}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for BTreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ConfigError> for BTreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
