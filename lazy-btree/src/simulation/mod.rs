//! Deterministic Simulation Testing (DST) infrastructure.
//!
//! This module provides tools for testing the tree with:
//! - In-memory record storage with fault injection
//! - Reproducible random workloads
//! - Invariant checking after batches of operations
//!
//! # Design Principles
//!
//! 1. All I/O goes through `NodeStore` and can be simulated
//! 2. All workload randomness is seeded for reproducibility
//! 3. Faults can be injected at any I/O boundary
//! 4. The tree is checked against a model of the keys it should hold
//!
//! # Usage
//!
//! ```ignore
//! use lazy_btree::simulation::{Simulator, SimulatorConfig};
//!
//! let config = SimulatorConfig::new(12345) // seed
//!     .with_order(3)
//!     .with_fault_rate(0.01);
//!
//! let mut sim = Simulator::new(config);
//! let result = sim.run(1000).await; // Run 1000 operations
//!
//! assert!(result.invariant_violations.is_empty());
//! ```

mod invariants;
mod simulator;
mod storage;

pub use invariants::{
    HistoryStats, InvariantChecker, InvariantViolation, Operation, OperationHistory,
};
pub use simulator::{SimulationResult, Simulator, SimulatorConfig};
pub use storage::{FaultConfig, SimulatedStore, SimulatedStoreStats};
