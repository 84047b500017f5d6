//! Node record storage.
//!
//! Each node of a tree is persisted as an independent record keyed by its
//! [`NodeId`](crate::types::NodeId). The root is always stored under `ROOT`.
//!
//! # Usage
//!
//! ```no_run
//! # async fn demo() -> Result<(), lazy_btree::storage::StorageError> {
//! use lazy_btree::storage::{FileStore, NodeStore};
//! use lazy_btree::types::NodeId;
//!
//! let store = FileStore::open("/var/lib/my-tree").await?;
//! store.write_record(&NodeId::root(), b"...").await?;
//! let bytes = store.read_record(&NodeId::root()).await?;
//! # let _ = bytes;
//! # Ok(())
//! # }
//! ```

mod file;
mod io;
mod record;

pub use file::FileStore;
pub use io::{NodeStore, StorageError};
pub use record::{NodeRecord, encode_parts};
