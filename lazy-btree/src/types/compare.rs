//! Key comparison.
//!
//! The tree never relies on `Ord` directly; every comparison goes through a
//! [`Compare`] implementation fixed at construction time.

use std::cmp::Ordering;

/// Total order over keys used by a tree.
///
/// Implementations must be consistent: `compare(a, b) == Equal` must mean
/// the keys are duplicates of each other for the lifetime of the tree.
pub trait Compare<K> {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders keys by their `Ord` implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<K: Ord> Compare<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

impl<K, F> Compare<K> for F
where
    F: Fn(&K, &K) -> Ordering,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self(a, b)
    }
}
