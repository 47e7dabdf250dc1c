//! Injected tree policy.
//!
//! The core never hard-codes key ordering or page thresholds; maps and
//! sequences carry a context object supplying them. [`TreeContext`]
//! deliberately has no merge threshold: [`OrderedMap`](crate::OrderedMap)
//! never merges underfull pages, only [`OrderedSequence`](crate::OrderedSequence)
//! does (see [`SeqContext`](crate::SeqContext)).

use std::cmp::Ordering;
use std::sync::Arc;

/// Default maximum page arity before a midpoint split.
pub const DEFAULT_SPLIT_AT: usize = 32;

/// Ordering and sizing policy for an [`OrderedMap`](crate::OrderedMap).
///
/// All key comparisons inside the tree delegate to [`TreeContext::compare`];
/// keys are unique under the injected order, so ties never occur between
/// distinct entries.
pub struct TreeContext<K> {
    compare: Box<dyn Fn(&K, &K) -> Ordering + Send + Sync>,
    split_at: usize,
}

impl<K: Ord + 'static> Default for TreeContext<K> {
    fn default() -> Self {
        Self::new(K::cmp)
    }
}

impl<K> TreeContext<K> {
    /// Create a context with the given total order and the default split
    /// threshold.
    pub fn new(compare: impl Fn(&K, &K) -> Ordering + Send + Sync + 'static) -> Self {
        Self {
            compare: Box::new(compare),
            split_at: DEFAULT_SPLIT_AT,
        }
    }

    /// Override the maximum page arity. Pages split at the midpoint when an
    /// insertion pushes their arity above this threshold.
    ///
    /// Panics if `split_at < 2`; a page must be able to hold both halves of
    /// a split.
    pub fn with_split_at(mut self, split_at: usize) -> Self {
        assert!(split_at >= 2, "split threshold must be at least 2");
        self.split_at = split_at;
        self
    }

    /// Compare two keys under the injected total order.
    pub fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.compare)(a, b)
    }

    /// The maximum page arity before a split.
    pub fn split_at(&self) -> usize {
        self.split_at
    }
}

impl<K: Ord + 'static> TreeContext<K> {
    /// A shared context with the natural key order and default thresholds.
    pub fn natural() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl<K> std::fmt::Debug for TreeContext<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeContext")
            .field("split_at", &self.split_at)
            .finish_non_exhaustive()
    }
}
