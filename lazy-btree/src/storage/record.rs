//! Persisted form of a node.
//!
//! # Record Format
//!
//! | Offset | Size | Content                                   |
//! |--------|------|-------------------------------------------|
//! | 0      | 4    | CRC-32 of the payload (little-endian)     |
//! | 4      | n    | JSON payload `{"keys":[..],"children":[..]}` |
//!
//! `children` holds child identifiers only, never nested subtrees.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::storage::io::StorageError;
use crate::types::NodeId;

const CHECKSUM_SIZE: usize = 4;

/// Keys and child identifiers of one node, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord<K> {
    pub keys: Vec<K>,
    pub children: Vec<NodeId>,
}

impl<K> NodeRecord<K>
where
    K: Serialize + DeserializeOwned,
{
    /// Encode the record with its checksum header.
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        encode_parts(&self.keys, &self.children)
    }

    /// Decode and validate a record read back from storage under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corruption`] if the checksum does not match,
    /// the payload is not a valid record, a child identifier is unsafe, or the
    /// node is neither a leaf nor has exactly `keys + 1` children.
    pub fn decode(id: &NodeId, bytes: &[u8]) -> Result<Self, StorageError> {
        let corrupt = |reason: String| StorageError::Corruption {
            id: id.clone(),
            reason,
        };

        if bytes.len() < CHECKSUM_SIZE {
            return Err(corrupt(format!("record too short ({} bytes)", bytes.len())));
        }
        let (header, payload) = bytes.split_at(CHECKSUM_SIZE);
        let stored = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let computed = crc32fast::hash(payload);
        if stored != computed {
            return Err(corrupt(format!(
                "checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"
            )));
        }

        let record: Self =
            serde_json::from_slice(payload).map_err(|e| corrupt(e.to_string()))?;

        if let Some(bad) = record
            .children
            .iter()
            .find(|child| NodeId::parse(child.as_str()).is_none() || child.is_root())
        {
            return Err(corrupt(format!("invalid child identifier '{bad}'")));
        }
        if !record.children.is_empty() && record.children.len() != record.keys.len() + 1 {
            return Err(corrupt(format!(
                "{} keys but {} children",
                record.keys.len(),
                record.children.len()
            )));
        }

        Ok(record)
    }
}

/// Borrowed view serialized exactly like [`NodeRecord`].
#[derive(Serialize)]
struct RecordRef<'a, K> {
    keys: &'a [K],
    children: &'a [NodeId],
}

/// Encode a record from borrowed parts, avoiding a copy of the keys.
pub fn encode_parts<K: Serialize>(
    keys: &[K],
    children: &[NodeId],
) -> Result<Vec<u8>, StorageError> {
    let payload = serde_json::to_vec(&RecordRef { keys, children })
        .map_err(|e| StorageError::Encode(e.to_string()))?;
    let checksum = crc32fast::hash(&payload);

    let mut bytes = Vec::with_capacity(CHECKSUM_SIZE + payload.len());
    bytes.extend_from_slice(&checksum.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}
