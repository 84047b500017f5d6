//! Main simulator harness for deterministic simulation testing.
//!
//! This module ties together the simulation components to drive a tree
//! through a seeded random workload of insertions, deletions and lookups,
//! checking it against a model after every batch of operations.

// Simulation code legitimately needs cloning for test data
#![allow(clippy::disallowed_methods)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::invariants::{InvariantChecker, InvariantViolation, OperationHistory};
use super::storage::{FaultConfig, SimulatedStore};
use crate::btree::{BTreeError, Tree};

/// Configuration for the simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Branching parameter of the tree under test.
    pub order: usize,
    /// Fault injection configuration.
    pub fault_config: FaultConfig,
    /// Keys are drawn from `0..key_space`.
    pub key_space: u64,
    /// Probability that an operation is an insertion.
    pub insert_ratio: f64,
    /// Probability that an operation is a deletion. The rest are lookups.
    pub delete_ratio: f64,
    /// Run the invariant checks every this many operations.
    pub check_every: usize,
    /// Drop the tree and reopen it from storage every this many operations.
    /// Zero disables reopening.
    pub reopen_every: usize,
}

impl SimulatorConfig {
    /// Create a new simulator config with the given seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            seed,
            order: 2,
            fault_config: FaultConfig {
                read_error_rate: 0.0,
                write_error_rate: 0.0,
                delete_error_rate: 0.0,
                corruption_rate: 0.0,
            },
            key_space: 200,
            insert_ratio: 0.5,
            delete_ratio: 0.35,
            check_every: 10,
            reopen_every: 50,
        }
    }

    /// Set the tree order.
    #[must_use]
    pub const fn with_order(mut self, order: usize) -> Self {
        self.order = order;
        self
    }

    /// Set the fault configuration.
    #[must_use]
    pub const fn with_fault_config(mut self, config: FaultConfig) -> Self {
        self.fault_config = config;
        self
    }

    /// Inject every kind of fault at the given rate.
    #[must_use]
    pub const fn with_fault_rate(mut self, rate: f64) -> Self {
        self.fault_config = FaultConfig {
            read_error_rate: rate,
            write_error_rate: rate,
            delete_error_rate: rate,
            corruption_rate: rate,
        };
        self
    }

    /// Set the key space.
    #[must_use]
    pub const fn with_key_space(mut self, key_space: u64) -> Self {
        self.key_space = key_space;
        self
    }

    /// Set how often the tree is reopened from storage.
    #[must_use]
    pub const fn with_reopen_every(mut self, reopen_every: usize) -> Self {
        self.reopen_every = reopen_every;
        self
    }
}

/// Results from a simulation run.
#[derive(Debug)]
pub struct SimulationResult {
    /// The seed used for this simulation.
    pub seed: u64,
    /// Number of operations processed.
    pub operations_processed: u64,
    /// Number of successful operations.
    pub successful_operations: u64,
    /// Number of rejected operations (duplicate insertions, absent deletions).
    pub failed_operations: u64,
    /// Number of operations whose persistence pass hit an injected fault.
    pub storage_failures: u64,
    /// Invariant violations detected.
    pub invariant_violations: Vec<InvariantViolation>,
    /// Whether the simulation ran to the end.
    pub completed_successfully: bool,
    /// Error message if simulation failed.
    pub error: Option<String>,
}

impl SimulationResult {
    /// Check if the simulation passed (no invariant violations).
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.completed_successfully && self.invariant_violations.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Insert(u64),
    Delete(u64),
    Find(u64),
}

/// The main simulator harness.
///
/// This ties together all simulation components:
/// - Simulated storage with fault injection
/// - Seeded workload generation
/// - Operation history and a model of the expected keys
/// - Invariant checker
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    history: OperationHistory,
    checker: InvariantChecker,
    operations_processed: u64,
    successful_operations: u64,
    failed_operations: u64,
    storage_failures: u64,
}

impl Simulator {
    /// Create a new simulator with the given configuration.
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            history: OperationHistory::new(),
            checker: InvariantChecker::new(),
            operations_processed: 0,
            successful_operations: 0,
            failed_operations: 0,
            storage_failures: 0,
        }
    }

    /// The operation history recorded so far.
    #[must_use]
    pub const fn history(&self) -> &OperationHistory {
        &self.history
    }

    /// Run the simulation for a given number of operations.
    ///
    /// This creates a fresh tree over simulated storage, applies the
    /// operations, and checks invariants along the way and at the end.
    pub async fn run(&mut self, operation_count: usize) -> SimulationResult {
        let store = SimulatedStore::with_config(self.config.seed, self.config.fault_config.clone());
        let outcome = match Tree::open(self.config.order, store).await {
            Ok(tree) => self.run_with_tree(tree, operation_count).await,
            Err(e) => Err(format!("Failed to open tree: {e}")),
        };

        let error = outcome.err();
        if let Some(e) = &error {
            tracing::warn!(seed = self.config.seed, error = %e, "simulation aborted");
        }
        SimulationResult {
            seed: self.config.seed,
            operations_processed: self.operations_processed,
            successful_operations: self.successful_operations,
            failed_operations: self.failed_operations,
            storage_failures: self.storage_failures,
            invariant_violations: std::mem::take(&mut self.checker).into_violations(),
            completed_successfully: error.is_none(),
            error,
        }
    }

    async fn run_with_tree(
        &mut self,
        mut tree: Tree<u64, SimulatedStore>,
        operation_count: usize,
    ) -> Result<(), String> {
        // A fresh tree's empty root has no record until the first save.
        self.recover(&mut tree).await?;
        for index in 1..=operation_count {
            let action = self.next_action();
            self.apply(&mut tree, action).await?;
            self.operations_processed += 1;

            if index % self.config.check_every.max(1) == 0 {
                self.check(&mut tree).await?;
            }
            if self.config.reopen_every > 0 && index % self.config.reopen_every == 0 {
                tree = Self::reopen(tree, self.config.order).await?;
            }
        }
        self.check(&mut tree).await
    }

    fn next_action(&mut self) -> Action {
        let key = self.rng.random_range(0..self.config.key_space.max(1));
        let roll: f64 = self.rng.random();
        if roll < self.config.insert_ratio {
            Action::Insert(key)
        } else if roll < self.config.insert_ratio + self.config.delete_ratio {
            Action::Delete(key)
        } else {
            Action::Find(key)
        }
    }

    async fn apply(&mut self, tree: &mut Tree<u64, SimulatedStore>, action: Action) -> Result<(), String> {
        match action {
            Action::Insert(key) => {
                let result = tree.insert(key).await;
                let error = self.settle(tree, key, result, true).await?;
                self.history.record_insert(key, error);
            }
            Action::Delete(key) => {
                let result = tree.delete(&key).await;
                let error = self.settle(tree, key, result, false).await?;
                self.history.record_delete(key, error);
            }
            Action::Find(key) => match tree.contains(&key).await {
                Ok(found) => {
                    if found != self.history.expected_keys().contains(&key) {
                        self.checker.add_violation(InvariantViolation {
                            description: "Lookup disagrees with model".to_string(),
                            operation_index: self.history.len(),
                            context: format!("key {key} found={found}"),
                        });
                    }
                    self.history.record_find(key, found);
                    self.successful_operations += 1;
                }
                Err(BTreeError::Storage(e)) => {
                    tracing::debug!(key, error = %e, "lookup hit a storage fault");
                    self.storage_failures += 1;
                }
                Err(e) => return Err(format!("lookup of {key} failed: {e}")),
            },
        }
        Ok(())
    }

    /// Classify the outcome of a mutation.
    ///
    /// Rejections leave the tree unchanged. A storage fault either struck
    /// before the mutation (a read) or after it (the save), so the save is
    /// retried without faults and the key's presence decides whether the
    /// mutation took. Returns the error to record, `None` when the mutation
    /// took effect.
    async fn settle(
        &mut self,
        tree: &mut Tree<u64, SimulatedStore>,
        key: u64,
        result: Result<(), BTreeError>,
        inserting: bool,
    ) -> Result<Option<String>, String> {
        match result {
            Ok(()) => {
                self.successful_operations += 1;
                Ok(None)
            }
            Err(e @ (BTreeError::DuplicateKey(_) | BTreeError::KeyNotFound(_))) => {
                self.failed_operations += 1;
                Ok(Some(e.to_string()))
            }
            Err(BTreeError::Storage(e)) => {
                self.storage_failures += 1;
                tracing::debug!(key, error = %e, "operation hit a storage fault, retrying save");
                self.set_faults(tree, false)?;
                tree.save()
                    .await
                    .map_err(|e| format!("save retry failed: {e}"))?;
                let present = tree
                    .contains(&key)
                    .await
                    .map_err(|e| format!("lookup after recovery failed: {e}"))?;
                self.set_faults(tree, true)?;
                if present == inserting {
                    self.successful_operations += 1;
                    Ok(None)
                } else {
                    self.failed_operations += 1;
                    Ok(Some(e.to_string()))
                }
            }
            Err(e) => Err(format!("operation on key {key} failed: {e}")),
        }
    }

    /// Switch fault injection on (the configured rates) or off.
    fn set_faults(&self, tree: &Tree<u64, SimulatedStore>, enabled: bool) -> Result<(), String> {
        let config = if enabled {
            self.config.fault_config.clone()
        } else {
            FaultConfig::no_faults()
        };
        tree.store()
            .ok_or("tree lost its store")?
            .set_fault_config(config)
            .map_err(|e| e.to_string())
    }

    /// Save with faults disabled.
    async fn recover(&self, tree: &mut Tree<u64, SimulatedStore>) -> Result<(), String> {
        self.set_faults(tree, false)?;
        let saved = tree.save().await;
        self.set_faults(tree, true)?;
        saved.map_err(|e| format!("save retry failed: {e}"))
    }

    async fn check(&mut self, tree: &mut Tree<u64, SimulatedStore>) -> Result<(), String> {
        self.set_faults(tree, false)?;
        let index = self.history.len();
        tree.load_all()
            .await
            .map_err(|e| format!("loading tree failed: {e}"))?;
        self.checker.check_structure(tree, index);

        let record_ids = tree
            .store()
            .ok_or("tree lost its store")?
            .record_ids()
            .map_err(|e| e.to_string())?;
        self.checker.check_persisted(tree, &record_ids, index);

        let keys = tree
            .in_order_keys()
            .await
            .map_err(|e| format!("listing keys failed: {e}"))?;
        self.checker
            .check_contents(&keys, self.history.expected_keys(), index);
        self.set_faults(tree, true)
    }

    async fn reopen(
        tree: Tree<u64, SimulatedStore>,
        order: usize,
    ) -> Result<Tree<u64, SimulatedStore>, String> {
        let store = tree.into_store().ok_or("tree lost its store")?;
        let reopened = Tree::open(order, store)
            .await
            .map_err(|e| format!("reopening tree failed: {e}"))?;
        tracing::debug!("reopened tree from storage");
        Ok(reopened)
    }
}
