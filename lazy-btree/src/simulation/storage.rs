//! Simulated in-memory record store for deterministic testing.
//!
//! This module provides an in-memory implementation of the `NodeStore` trait
//! with support for fault injection:
//! - Record-level read/write/delete errors
//! - Byte-level corruption (bit flips) on read

// Simulation code legitimately needs cloning for test data
#![allow(clippy::disallowed_methods)]

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::{NodeStore, StorageError};
use crate::types::NodeId;

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a delete error (0.0 - 1.0).
    pub delete_error_rate: f64,
    /// Probability of record corruption on read (0.0 - 1.0).
    pub corruption_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with low fault rates (for stress testing).
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            read_error_rate: 0.001,
            write_error_rate: 0.001,
            delete_error_rate: 0.001,
            corruption_rate: 0.001,
        }
    }

    /// Create a fault config with high fault rates (for extreme testing).
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            read_error_rate: 0.05,
            write_error_rate: 0.05,
            delete_error_rate: 0.05,
            corruption_rate: 0.05,
        }
    }
}

/// Statistics about simulated storage operations.
#[derive(Debug, Default, Clone)]
pub struct SimulatedStoreStats {
    /// Number of record reads.
    pub reads: u64,
    /// Number of record writes.
    pub writes: u64,
    /// Number of record deletes.
    pub deletes: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected delete errors.
    pub injected_delete_errors: u64,
    /// Number of corrupted records returned.
    pub corrupted_reads: u64,
}

struct Inner {
    records: HashMap<NodeId, Vec<u8>>,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: SimulatedStoreStats,
}

impl Inner {
    /// Check if a fault should be injected based on the given rate.
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    /// Corrupt a record by flipping random bits in one byte.
    fn corrupt(&mut self, bytes: &mut [u8]) {
        if bytes.is_empty() {
            return;
        }
        let byte_offset = self.rng.random_range(0..bytes.len());
        let mask = self.rng.random_range(1..=u8::MAX);
        bytes[byte_offset] ^= mask;
    }
}

/// In-memory record store for deterministic testing.
///
/// This implementation stores records in memory and supports:
/// - Fault injection based on configurable rates
/// - Deterministic behavior via seeded RNG
///
/// State sits behind a mutex because `NodeStore` methods take `&self`.
pub struct SimulatedStore {
    inner: Mutex<Inner>,
}

impl SimulatedStore {
    /// Create a new simulated store with the given seed.
    ///
    /// The seed ensures deterministic behavior - the same seed will
    /// produce the same sequence of faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a new simulated store with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: SimulatedStoreStats::default(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Get a snapshot of the current statistics.
    pub fn stats(&self) -> Result<SimulatedStoreStats, StorageError> {
        Ok(self.lock()?.stats.clone())
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) -> Result<(), StorageError> {
        self.lock()?.fault_config = config;
        Ok(())
    }

    /// Identifiers of every stored record, sorted.
    pub fn record_ids(&self) -> Result<Vec<NodeId>, StorageError> {
        let mut ids: Vec<NodeId> = self.lock()?.records.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Raw bytes of a record, bypassing fault injection.
    pub fn raw_record(&self, id: &NodeId) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock()?.records.get(id).cloned())
    }
}

impl NodeStore for SimulatedStore {
    async fn read_record(&self, id: &NodeId) -> Result<Vec<u8>, StorageError> {
        let mut inner = self.lock()?;
        inner.stats.reads += 1;

        let rate = inner.fault_config.read_error_rate;
        if inner.should_inject_fault(rate) {
            inner.stats.injected_read_errors += 1;
            return Err(StorageError::InjectedFault(format!(
                "simulated read error on {id}"
            )));
        }

        let mut bytes = inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;

        let rate = inner.fault_config.corruption_rate;
        if inner.should_inject_fault(rate) {
            inner.stats.corrupted_reads += 1;
            inner.corrupt(&mut bytes);
        }

        Ok(bytes)
    }

    async fn write_record(&self, id: &NodeId, bytes: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.stats.writes += 1;

        let rate = inner.fault_config.write_error_rate;
        if inner.should_inject_fault(rate) {
            inner.stats.injected_write_errors += 1;
            return Err(StorageError::InjectedFault(format!(
                "simulated write error on {id}"
            )));
        }

        inner.records.insert(id.clone(), bytes.to_vec());
        Ok(())
    }

    async fn delete_record(&self, id: &NodeId) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.stats.deletes += 1;

        let rate = inner.fault_config.delete_error_rate;
        if inner.should_inject_fault(rate) {
            inner.stats.injected_delete_errors += 1;
            return Err(StorageError::InjectedFault(format!(
                "simulated delete error on {id}"
            )));
        }

        inner
            .records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    async fn exists(&self, id: &NodeId) -> Result<bool, StorageError> {
        Ok(self.lock()?.records.contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_store_basic() {
        let store = SimulatedStore::new(12345);
        let id = NodeId::root();

        assert!(!store.exists(&id).await.expect("exists should succeed"));
        store.write_record(&id, b"hello world").await.expect("write should succeed");
        assert!(store.exists(&id).await.expect("exists should succeed"));
        assert_eq!(store.read_record(&id).await.expect("read should succeed"), b"hello world");

        store.delete_record(&id).await.expect("record delete should succeed");
        assert!(matches!(
            store.read_record(&id).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_record(&id).await,
            Err(StorageError::NotFound(_))
        ));

        let stats = store.stats().expect("stats should be readable");
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.deletes, 2);
    }

    #[tokio::test]
    async fn test_simulated_store_fault_injection() {
        let config = FaultConfig {
            write_error_rate: 1.0, // Always fail
            ..Default::default()
        };
        let store = SimulatedStore::with_config(12345, config);

        let result = store.write_record(&NodeId::root(), b"x").await;
        assert!(matches!(result, Err(StorageError::InjectedFault(_))));
        assert!(store.record_ids().expect("record ids should be listable").is_empty());

        // Stats should reflect the error
        assert_eq!(store.stats().expect("stats should be readable").injected_write_errors, 1);

        store.set_fault_config(FaultConfig::no_faults()).expect("fault config should apply");
        store.write_record(&NodeId::root(), b"x").await.expect("write should succeed");
        assert_eq!(store.record_ids().expect("record ids should be listable"), vec![NodeId::root()]);
    }

    #[tokio::test]
    async fn test_simulated_store_corruption_leaves_stored_bytes_intact() {
        let config = FaultConfig {
            corruption_rate: 1.0,
            ..Default::default()
        };
        let store = SimulatedStore::with_config(7, config);
        let id = NodeId::root();
        store.write_record(&id, &[0u8; 32]).await.expect("write should succeed");

        let read = store.read_record(&id).await.expect("read should succeed");
        assert_ne!(read, vec![0u8; 32]);
        assert_eq!(store.raw_record(&id).expect("raw record should be readable"), Some(vec![0u8; 32]));
        assert_eq!(store.stats().expect("stats should be readable").corrupted_reads, 1);
    }

    #[tokio::test]
    async fn test_simulated_store_deterministic() {
        // Same seed should produce same behavior
        let config = FaultConfig {
            read_error_rate: 0.5,
            ..Default::default()
        };
        let id = NodeId::root();

        let mut runs = Vec::new();
        for _ in 0..2 {
            let store = SimulatedStore::with_config(12345, config.clone());
            store.write_record(&id, b"payload").await.expect("write should succeed");
            let mut results = Vec::new();
            for _ in 0..10 {
                results.push(store.read_record(&id).await.is_ok());
            }
            runs.push(results);
        }

        assert_eq!(runs[0], runs[1], "Same seed should produce same fault pattern");
    }
}
