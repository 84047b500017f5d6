//! Storage abstraction for node records.
//!
//! This module provides a `NodeStore` trait that abstracts over the durable
//! key→bytes store holding one record per node, allowing the tree to use real
//! file I/O in production and simulated in-memory storage in tests.
//!
//! # Design
//!
//! The trait is a minimal abstraction over four record operations:
//! - Read a record by identifier
//! - Write (create or replace) a record
//! - Delete a record
//! - Check whether a record exists (used to avoid identifier collisions)
//!
//! Methods take `&self` so that independent records can be written or
//! deleted concurrently within one persistence pass.

use crate::types::NodeId;

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// No record exists under the identifier.
    NotFound(NodeId),
    /// A record exists but could not be decoded.
    Corruption { id: NodeId, reason: String },
    /// A node could not be encoded into a record.
    Encode(String),
    /// Injected fault for simulation.
    InjectedFault(String),
    /// A lock guarding backend state was poisoned by a panicking holder.
    LockPoisoned,
    /// A record was requested from a tree that has no storage configured.
    NotConfigured,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::NotFound(id) => write!(f, "record {id} not found"),
            Self::Corruption { id, reason } => write!(f, "record {id} is corrupt: {reason}"),
            Self::Encode(msg) => write!(f, "failed to encode record: {msg}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::LockPoisoned => write!(f, "storage lock poisoned"),
            Self::NotConfigured => write!(f, "no storage backend configured"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Durable store of node records keyed by [`NodeId`].
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `read_record` returns the bytes of the last successful `write_record`
/// - `read_record` and `delete_record` report a missing record as
///   [`StorageError::NotFound`]
/// - `exists` reflects writes and deletes that have completed
#[allow(async_fn_in_trait)] // The tree is driven from a single task; no Send bound is needed.
pub trait NodeStore {
    /// Read the encoded record stored under `id`.
    async fn read_record(&self, id: &NodeId) -> Result<Vec<u8>, StorageError>;

    /// Create or replace the record stored under `id`.
    async fn write_record(&self, id: &NodeId, bytes: &[u8]) -> Result<(), StorageError>;

    /// Remove the record stored under `id`.
    async fn delete_record(&self, id: &NodeId) -> Result<(), StorageError>;

    /// Whether a record is stored under `id`.
    async fn exists(&self, id: &NodeId) -> Result<bool, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let e = StorageError::NotFound(NodeId::root());
        assert_eq!(e.to_string(), "record ROOT not found");

        let e = StorageError::Corruption {
            id: NodeId::root(),
            reason: "checksum mismatch".to_string(),
        };
        assert!(e.to_string().contains("ROOT"));
        assert!(e.to_string().contains("checksum mismatch"));

        let e = StorageError::InjectedFault("test fault".to_string());
        assert!(e.to_string().contains("test fault"));
    }

    #[test]
    fn test_io_error_has_source() {
        use std::error::Error;

        let e = StorageError::from(std::io::Error::other("disk gone"));
        assert!(e.source().is_some());
        assert!(StorageError::LockPoisoned.source().is_none());
    }
}
