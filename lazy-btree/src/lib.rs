// Life of an operation:
// 1. Descend from the root to the target node, reading child records from
//    storage the first time each node is needed
// 2. Mutate the node locally
// 3. Restore occupancy bounds:
//     - Insert: split overflowing nodes upward
//     - Delete: rotate from a sibling or merge with it, upward
// 4. Save: delete the records of retired nodes, write every dirty node
//
// System components:
//  - B-tree (nodes, rebalancing, persistence bookkeeping)
//  - Record storage (one checksummed record per node)
//  - Deterministic simulation harness (tests, or the `simulation` feature)

pub mod btree;
pub mod config;
#[cfg(any(test, feature = "simulation"))]
pub mod simulation;
pub mod storage;
#[cfg(test)]
mod testing;
pub mod types;

pub use btree::{BTreeError, Tree};
pub use config::{ConfigError, TreeConfig};
pub use storage::{FileStore, NodeStore, StorageError};
