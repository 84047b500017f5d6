//! Identifier types for tree nodes.
//!
//! Two identifiers exist for every resident node:
//!
//! - [`NodeId`]: the durable storage key of the node's record. The root always
//!   carries [`NodeId::ROOT`].
//! - [`NodeHandle`]: the in-memory arena handle. Handles never change while a
//!   node is resident, even when the node is promoted to root and its
//!   `NodeId` is rewritten.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Storage identifier of a node record.
///
/// # Invariants
///
/// - Never empty.
/// - Never contains a path separator, so it is safe to use as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Reserved identifier of the root record.
    pub const ROOT_NAME: &'static str = "ROOT";

    /// The reserved root identifier.
    #[must_use]
    pub fn root() -> Self {
        Self(Self::ROOT_NAME.to_string())
    }

    /// Draw a fresh random identifier (128 random bits, lowercase hex).
    ///
    /// Uniqueness against existing records is the caller's job; see
    /// `Tree::fresh_id`.
    #[must_use]
    pub fn random() -> Self {
        let bits: u128 = rand::rng().random();
        Self(format!("{bits:032x}"))
    }

    /// Parse an identifier read back from a record.
    ///
    /// Returns `None` if the identifier is empty or could escape the
    /// storage directory.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw != "."
            && raw != ".."
            && !raw.contains(['/', '\\', '\0']);
        valid.then(|| Self(raw.to_string()))
    }

    /// Whether this is the reserved root identifier.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT_NAME
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle of a resident node inside the tree's arena.
///
/// Handles are allocated from a monotonically increasing counter and are
/// never reused by the same tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(pub(crate) u64);

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_id() {
        let root = NodeId::root();
        assert!(root.is_root());
        assert_eq!(root.to_string(), "ROOT");
    }

    #[test]
    fn test_random_ids_are_hex_and_distinct() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!a.is_root());
    }

    #[test]
    fn test_parse_rejects_unsafe_names() {
        assert!(NodeId::parse("").is_none());
        assert!(NodeId::parse("..").is_none());
        assert!(NodeId::parse("a/b").is_none());
        assert!(NodeId::parse("a\\b").is_none());
        assert_eq!(NodeId::parse("ROOT"), Some(NodeId::root()));
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = NodeId::parse("abc").expect("valid id");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"abc\"");
    }
}
