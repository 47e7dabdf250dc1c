//! Persistent sequence backed by a counted S-tree.
//!
//! Shares the page algebra of [`OrderedMap`](crate::OrderedMap) — immutable
//! pages, midpoint splits, structural sharing — but entries are keyed by a
//! runtime-generated [`SeqId`] rather than a caller-chosen key, and interior
//! pages navigate by cached subtree sizes instead of separator keys. Unlike
//! the map, underfull pages merge with a neighbour: the sequence backs
//! long-lived, frequently-mutated streams where fragmentation matters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::context::DEFAULT_SPLIT_AT;

/// Stable identifier of a sequence entry, generated when the entry is
/// inserted and preserved across in-place updates. Fixed-width and unique
/// within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeqId(u64);

/// Process-wide id seed, drawn once. Ids mix the seed with an atomic counter
/// so they are unique and unpredictable across runs without per-call entropy.
static ID_SEED: OnceLock<u64> = OnceLock::new();
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

impl SeqId {
    /// Generate a fresh id from the process-wide seed.
    pub fn generate() -> SeqId {
        let seed = *ID_SEED.get_or_init(|| getrandom::u64().unwrap_or(0xA076_1D64_78BD_642F));
        let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        SeqId(splitmix64(seed ^ n.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
    }

    /// The raw id value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Identification and sizing policy for an [`OrderedSequence`].
///
/// Unlike [`TreeContext`](crate::TreeContext) this carries a merge threshold:
/// pages whose arity falls below it are merged with a neighbour and re-split
/// if the merged page overflows.
pub struct SeqContext<V> {
    identify: Box<dyn Fn(&V) -> SeqId + Send + Sync>,
    split_at: usize,
    merge_at: usize,
}

impl<V> Default for SeqContext<V> {
    fn default() -> Self {
        Self {
            identify: Box::new(|_| SeqId::generate()),
            split_at: DEFAULT_SPLIT_AT,
            merge_at: DEFAULT_SPLIT_AT / 2,
        }
    }
}

impl<V> SeqContext<V> {
    /// A context with an injected identifier function and default thresholds.
    pub fn new(identify: impl Fn(&V) -> SeqId + Send + Sync + 'static) -> Self {
        Self {
            identify: Box::new(identify),
            ..Self::default()
        }
    }

    /// Override the split threshold; the merge threshold follows at half
    /// unless overridden afterwards.
    pub fn with_split_at(mut self, split_at: usize) -> Self {
        assert!(split_at >= 2, "split threshold must be at least 2");
        self.split_at = split_at;
        self.merge_at = split_at / 2;
        self
    }

    /// Override the merge threshold. Must stay below the split threshold or
    /// merge and split would fight each other.
    pub fn with_merge_at(mut self, merge_at: usize) -> Self {
        assert!(merge_at < self.split_at, "merge threshold must be below split");
        self.merge_at = merge_at;
        self
    }

    /// Generate the id for a value about to be inserted.
    pub fn identify(&self, value: &V) -> SeqId {
        (self.identify)(value)
    }

    /// The maximum page arity before a split.
    pub fn split_at(&self) -> usize {
        self.split_at
    }

    /// The arity below which a page merges with a neighbour.
    pub fn merge_at(&self) -> usize {
        self.merge_at
    }
}

impl<V> std::fmt::Debug for SeqContext<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeqContext")
            .field("split_at", &self.split_at)
            .field("merge_at", &self.merge_at)
            .finish_non_exhaustive()
    }
}

enum SeqPage<V> {
    Leaf { entries: Vec<(SeqId, V)> },
    Interior { children: Vec<Arc<SeqPage<V>>>, size: usize },
}

impl<V> SeqPage<V> {
    fn leaf(entries: Vec<(SeqId, V)>) -> Arc<Self> {
        Arc::new(SeqPage::Leaf { entries })
    }

    fn interior(children: Vec<Arc<SeqPage<V>>>) -> Arc<Self> {
        let size = children.iter().map(|c| c.len()).sum();
        Arc::new(SeqPage::Interior { children, size })
    }

    fn len(&self) -> usize {
        match self {
            SeqPage::Leaf { entries } => entries.len(),
            SeqPage::Interior { size, .. } => *size,
        }
    }

    fn arity(&self) -> usize {
        match self {
            SeqPage::Leaf { entries } => entries.len(),
            SeqPage::Interior { children, .. } => children.len(),
        }
    }
}

/// A persistent, position-indexed sequence with stable entry ids.
///
/// All mutating operations return a new sequence sharing unmodified pages
/// with the original. Indexing past the end of the sequence is programmer
/// misuse and panics, like slice indexing; use [`OrderedSequence::get`] for
/// a total lookup.
pub struct OrderedSequence<V> {
    root: Arc<SeqPage<V>>,
    context: Arc<SeqContext<V>>,
}

impl<V> Clone for OrderedSequence<V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            context: self.context.clone(),
        }
    }
}

impl<V> Default for OrderedSequence<V> {
    fn default() -> Self {
        Self::new()
    }
}

enum Inserted<V> {
    Single(Arc<SeqPage<V>>),
    Split(Arc<SeqPage<V>>, Arc<SeqPage<V>>),
}

impl<V> OrderedSequence<V> {
    /// An empty sequence with seeded random ids and default thresholds.
    pub fn new() -> Self {
        Self::with_context(Arc::new(SeqContext::default()))
    }

    /// An empty sequence with an injected identification and sizing policy.
    pub fn with_context(context: Arc<SeqContext<V>>) -> Self {
        Self {
            root: SeqPage::leaf(Vec::new()),
            context,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.root.len()
    }

    /// Returns true if the sequence holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.len() == 0
    }

    /// The value at `index`, or `None` past the end.
    pub fn get(&self, index: usize) -> Option<&V> {
        self.entry(index).map(|(_, v)| v)
    }

    /// The id and value at `index`, or `None` past the end.
    pub fn entry(&self, mut index: usize) -> Option<(SeqId, &V)> {
        if index >= self.len() {
            return None;
        }
        let mut page = self.root.as_ref();
        loop {
            match page {
                SeqPage::Leaf { entries } => {
                    let (id, v) = &entries[index];
                    return Some((*id, v));
                }
                SeqPage::Interior { children, .. } => {
                    let mut idx = 0;
                    while children[idx].len() <= index {
                        index -= children[idx].len();
                        idx += 1;
                    }
                    page = children[idx].as_ref();
                }
            }
        }
    }

    /// The current index of the entry with the given id, or `None` if it was
    /// removed. O(n): ids are stable handles, not search keys.
    pub fn index_of(&self, id: SeqId) -> Option<usize> {
        self.iter().position(|(entry_id, _)| entry_id == id)
    }

    /// In-order iterator over `(id, value)` entries.
    pub fn iter(&self) -> SeqIter<'_, V> {
        SeqIter {
            stack: vec![(self.root.as_ref(), 0)],
        }
    }
}

impl<V: Clone> OrderedSequence<V> {
    /// A new sequence with `value` inserted at `index`, identified by a
    /// fresh id from the context. Panics if `index > len`.
    #[must_use]
    pub fn inserted(&self, index: usize, value: V) -> Self {
        assert!(
            index <= self.len(),
            "inserted past tree bounds: {index} > {}",
            self.len()
        );
        let id = self.context.identify(&value);
        let root = match Self::insert_in(&self.root, index, id, value, &self.context) {
            Inserted::Single(page) => page,
            Inserted::Split(left, right) => SeqPage::interior(vec![left, right]),
        };
        Self {
            root,
            context: self.context.clone(),
        }
    }

    /// A new sequence with `value` appended.
    #[must_use]
    pub fn pushed(&self, value: V) -> Self {
        self.inserted(self.len(), value)
    }

    fn insert_in(
        page: &Arc<SeqPage<V>>,
        index: usize,
        id: SeqId,
        value: V,
        context: &SeqContext<V>,
    ) -> Inserted<V> {
        match page.as_ref() {
            SeqPage::Leaf { entries } => {
                let mut entries = entries.clone();
                entries.insert(index, (id, value));
                if entries.len() <= context.split_at() {
                    return Inserted::Single(SeqPage::leaf(entries));
                }
                let right = entries.split_off(entries.len() / 2);
                Inserted::Split(SeqPage::leaf(entries), SeqPage::leaf(right))
            }
            SeqPage::Interior { children, .. } => {
                let mut index = index;
                let mut idx = 0;
                while idx + 1 < children.len() && children[idx].len() < index {
                    index -= children[idx].len();
                    idx += 1;
                }
                let mut children = children.clone();
                match Self::insert_in(&children[idx], index, id, value, context) {
                    Inserted::Single(child) => children[idx] = child,
                    Inserted::Split(left, right) => {
                        children[idx] = left;
                        children.insert(idx + 1, right);
                    }
                }
                if children.len() <= context.split_at() {
                    return Inserted::Single(SeqPage::interior(children));
                }
                let right = children.split_off(children.len() / 2);
                Inserted::Split(SeqPage::interior(children), SeqPage::interior(right))
            }
        }
    }

    /// A new sequence with the value at `index` replaced, keeping the
    /// entry's id. Panics if `index >= len`.
    #[must_use]
    pub fn updated(&self, index: usize, value: V) -> Self {
        assert!(
            index < self.len(),
            "updated past tree bounds: {index} >= {}",
            self.len()
        );
        Self {
            root: Self::update_in(&self.root, index, value),
            context: self.context.clone(),
        }
    }

    fn update_in(page: &Arc<SeqPage<V>>, mut index: usize, value: V) -> Arc<SeqPage<V>> {
        match page.as_ref() {
            SeqPage::Leaf { entries } => {
                let mut entries = entries.clone();
                entries[index] = (entries[index].0, value);
                SeqPage::leaf(entries)
            }
            SeqPage::Interior { children, .. } => {
                let mut idx = 0;
                while children[idx].len() <= index {
                    index -= children[idx].len();
                    idx += 1;
                }
                let mut children = children.clone();
                children[idx] = Self::update_in(&children[idx], index, value);
                SeqPage::interior(children)
            }
        }
    }

    /// A new sequence without the entry at `index`. Underfull pages merge
    /// with a neighbour and re-split on overflow. Panics if `index >= len`.
    #[must_use]
    pub fn removed(&self, index: usize) -> Self {
        assert!(
            index < self.len(),
            "removed past tree bounds: {index} >= {}",
            self.len()
        );
        let mut root = Self::remove_in(&self.root, index, &self.context);
        // Collapse a single-child root chain left behind by merges.
        loop {
            let collapsed = match root.as_ref() {
                SeqPage::Interior { children, .. } if children.len() == 1 => children[0].clone(),
                _ => break,
            };
            root = collapsed;
        }
        Self {
            root,
            context: self.context.clone(),
        }
    }

    fn remove_in(
        page: &Arc<SeqPage<V>>,
        mut index: usize,
        context: &SeqContext<V>,
    ) -> Arc<SeqPage<V>> {
        match page.as_ref() {
            SeqPage::Leaf { entries } => {
                let mut entries = entries.clone();
                entries.remove(index);
                SeqPage::leaf(entries)
            }
            SeqPage::Interior { children, .. } => {
                let mut idx = 0;
                while children[idx].len() <= index {
                    index -= children[idx].len();
                    idx += 1;
                }
                let mut children = children.clone();
                children[idx] = Self::remove_in(&children[idx], index, context);
                if children.len() > 1 && children[idx].arity() < context.merge_at() {
                    let sibling = if idx + 1 < children.len() { idx + 1 } else { idx - 1 };
                    let (lo, hi) = (idx.min(sibling), idx.max(sibling));
                    let merged = Self::merged(&children[lo], &children[hi], context);
                    children.splice(lo..=hi, merged);
                }
                SeqPage::interior(children)
            }
        }
    }

    /// Merge two sibling pages, re-splitting at the midpoint if the merged
    /// page overflows. Siblings are always the same height.
    fn merged(
        a: &Arc<SeqPage<V>>,
        b: &Arc<SeqPage<V>>,
        context: &SeqContext<V>,
    ) -> Vec<Arc<SeqPage<V>>> {
        match (a.as_ref(), b.as_ref()) {
            (SeqPage::Leaf { entries: left }, SeqPage::Leaf { entries: right }) => {
                let mut entries = left.clone();
                entries.extend(right.iter().cloned());
                if entries.len() <= context.split_at() {
                    vec![SeqPage::leaf(entries)]
                } else {
                    let right = entries.split_off(entries.len() / 2);
                    vec![SeqPage::leaf(entries), SeqPage::leaf(right)]
                }
            }
            (SeqPage::Interior { children: left, .. }, SeqPage::Interior { children: right, .. }) => {
                let mut children = left.clone();
                children.extend(right.iter().cloned());
                if children.len() <= context.split_at() {
                    vec![SeqPage::interior(children)]
                } else {
                    let right = children.split_off(children.len() / 2);
                    vec![SeqPage::interior(children), SeqPage::interior(right)]
                }
            }
            _ => unreachable!("sibling pages differ in height"),
        }
    }

    /// The first `n` entries as a new sequence. Panics if `n > len`.
    #[must_use]
    pub fn taken(&self, n: usize) -> Self {
        assert!(n <= self.len(), "taken past tree bounds: {n} > {}", self.len());
        let root = if n == 0 {
            SeqPage::leaf(Vec::new())
        } else if n == self.len() {
            self.root.clone()
        } else {
            Self::take_in(&self.root, n)
        };
        Self {
            root,
            context: self.context.clone(),
        }
    }

    /// Everything but the first `n` entries as a new sequence. Panics if
    /// `n > len`.
    #[must_use]
    pub fn dropped(&self, n: usize) -> Self {
        assert!(
            n <= self.len(),
            "dropped past tree bounds: {n} > {}",
            self.len()
        );
        let root = if n == 0 {
            self.root.clone()
        } else if n == self.len() {
            SeqPage::leaf(Vec::new())
        } else {
            Self::drop_in(&self.root, n)
        };
        Self {
            root,
            context: self.context.clone(),
        }
    }

    fn take_in(page: &Arc<SeqPage<V>>, n: usize) -> Arc<SeqPage<V>> {
        match page.as_ref() {
            SeqPage::Leaf { entries } => SeqPage::leaf(entries[..n].to_vec()),
            SeqPage::Interior { children, .. } => {
                let mut kept = Vec::new();
                let mut remaining = n;
                for child in children {
                    if remaining == 0 {
                        break;
                    }
                    if child.len() <= remaining {
                        remaining -= child.len();
                        kept.push(child.clone());
                    } else {
                        kept.push(Self::take_in(child, remaining));
                        remaining = 0;
                    }
                }
                if kept.len() == 1 {
                    return kept.pop().expect("one child");
                }
                SeqPage::interior(kept)
            }
        }
    }

    fn drop_in(page: &Arc<SeqPage<V>>, n: usize) -> Arc<SeqPage<V>> {
        match page.as_ref() {
            SeqPage::Leaf { entries } => SeqPage::leaf(entries[n..].to_vec()),
            SeqPage::Interior { children, .. } => {
                let mut remaining = n;
                let mut first = 0;
                while children[first].len() <= remaining {
                    remaining -= children[first].len();
                    first += 1;
                }
                let mut kept = Vec::with_capacity(children.len() - first);
                if remaining > 0 {
                    kept.push(Self::drop_in(&children[first], remaining));
                } else {
                    kept.push(children[first].clone());
                }
                kept.extend(children[first + 1..].iter().cloned());
                if kept.len() == 1 {
                    return kept.pop().expect("one child");
                }
                SeqPage::interior(kept)
            }
        }
    }
}

/// In-order entry iterator over a sequence.
pub struct SeqIter<'a, V> {
    stack: Vec<(&'a SeqPage<V>, usize)>,
}

impl<'a, V> Iterator for SeqIter<'a, V> {
    type Item = (SeqId, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (page, idx) = self.stack.pop()?;
            match page {
                SeqPage::Leaf { entries } => {
                    if let Some((id, v)) = entries.get(idx) {
                        self.stack.push((page, idx + 1));
                        return Some((*id, v));
                    }
                }
                SeqPage::Interior { children, .. } => {
                    if let Some(child) = children.get(idx) {
                        self.stack.push((page, idx + 1));
                        self.stack.push((child.as_ref(), 0));
                    }
                }
            }
        }
    }
}

impl<V: PartialEq> PartialEq for OrderedSequence<V> {
    /// Sequences compare by value order; ids are runtime-generated and are
    /// not part of equality.
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|((_, a), (_, b))| a == b)
    }
}

impl<V: std::fmt::Debug> std::fmt::Debug for OrderedSequence<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter().map(|(_, v)| v)).finish()
    }
}
