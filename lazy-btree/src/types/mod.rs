//! Shared value types.

mod compare;
mod ids;

pub use compare::{Compare, NaturalOrder};
pub use ids::{NodeHandle, NodeId};
