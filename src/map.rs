//! Persistent ordered map backed by a structurally-shared B-tree.

use std::any::Any;
use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};

use crate::context::TreeContext;

/// A persistent, structurally-shared ordered map.
///
/// Every update returns a new map that differs from the original only along
/// the path from the root to the touched key; all other pages are shared by
/// reference. Pages are never mutated after construction, so a map can be
/// cloned and read from any number of threads while new versions are built
/// elsewhere.
///
/// Key ordering and page sizing are injected through a [`TreeContext`];
/// nothing in the tree hard-codes them. Missing keys are `None`, never an
/// error. Leaves collapse to empty on full removal but are deliberately not
/// merged on underflow; see [`OrderedSequence`](crate::OrderedSequence) for
/// the merging variant.
///
/// # Examples
///
/// ```
/// # use streamflow::OrderedMap;
/// let m = OrderedMap::new().updated("a", 1).updated("b", 2);
/// let m2 = m.removed(&"a");
/// assert_eq!(m.get(&"a"), Some(&1));
/// assert_eq!(m2.get(&"a"), None);
/// assert_eq!(m2.get(&"b"), Some(&2));
/// ```
pub struct OrderedMap<K, V> {
    root: Arc<Page<K, V>>,
    context: Arc<TreeContext<K>>,
}

impl<K, V> Clone for OrderedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            context: self.context.clone(),
        }
    }
}

/// A B-tree page: a leaf of sorted entries or an interior node of child
/// pages. Immutable after construction.
pub(crate) enum Page<K, V> {
    Leaf(Leaf<K, V>),
    Interior(Interior<K, V>),
}

pub(crate) struct Leaf<K, V> {
    entries: Vec<(K, V)>,
    memo: OnceLock<Box<dyn Any + Send + Sync>>,
}

pub(crate) struct Interior<K, V> {
    /// `separators[i]` is the least key reachable under `children[i + 1]`.
    separators: Vec<K>,
    children: Vec<Arc<Page<K, V>>>,
    /// Cached subtree entry count.
    size: usize,
    memo: OnceLock<Box<dyn Any + Send + Sync>>,
}

impl<K, V> Page<K, V> {
    fn leaf(entries: Vec<(K, V)>) -> Arc<Self> {
        Arc::new(Page::Leaf(Leaf {
            entries,
            memo: OnceLock::new(),
        }))
    }

    fn interior(separators: Vec<K>, children: Vec<Arc<Page<K, V>>>) -> Arc<Self> {
        debug_assert_eq!(separators.len() + 1, children.len());
        let size = children.iter().map(|c| c.len()).sum();
        Arc::new(Page::Interior(Interior {
            separators,
            children,
            size,
            memo: OnceLock::new(),
        }))
    }

    /// Subtree entry count.
    pub(crate) fn len(&self) -> usize {
        match self {
            Page::Leaf(leaf) => leaf.entries.len(),
            Page::Interior(node) => node.size,
        }
    }

    fn memo(&self) -> &OnceLock<Box<dyn Any + Send + Sync>> {
        match self {
            Page::Leaf(leaf) => &leaf.memo,
            Page::Interior(node) => &node.memo,
        }
    }

    fn first_entry(&self) -> Option<(&K, &V)> {
        match self {
            Page::Leaf(leaf) => leaf.entries.first().map(|(k, v)| (k, v)),
            Page::Interior(node) => node.children.first()?.first_entry(),
        }
    }

    fn last_entry(&self) -> Option<(&K, &V)> {
        match self {
            Page::Leaf(leaf) => leaf.entries.last().map(|(k, v)| (k, v)),
            Page::Interior(node) => node.children.last()?.last_entry(),
        }
    }
}

impl<K, V> Interior<K, V> {
    /// Index of the child that may contain `key`: the number of separators
    /// less than or equal to it.
    fn child_index(&self, key: &K, context: &TreeContext<K>) -> usize {
        self.separators
            .partition_point(|s| context.compare(s, key) != Ordering::Greater)
    }
}

/// Result of inserting into a subtree: either a single replacement page or a
/// midpoint split with the promoted separator.
enum Updated<K, V> {
    Single(Arc<Page<K, V>>),
    Split(Arc<Page<K, V>>, K, Arc<Page<K, V>>),
}

impl<K: Ord + 'static, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + 'static, V> OrderedMap<K, V> {
    /// An empty map ordered by the natural key order.
    pub fn new() -> Self {
        Self::with_context(TreeContext::natural())
    }
}

impl<K, V> OrderedMap<K, V> {
    /// An empty map with an injected ordering and sizing policy.
    pub fn with_context(context: Arc<TreeContext<K>>) -> Self {
        Self {
            root: Page::leaf(Vec::new()),
            context,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.root.len()
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.len() == 0
    }

    /// The tree policy this map was built with.
    pub fn context(&self) -> &Arc<TreeContext<K>> {
        &self.context
    }

    /// Look up a key. Absence is `None`, never an error.
    pub fn get(&self, key: &K) -> Option<&V> {
        let mut page = self.root.as_ref();
        loop {
            match page {
                Page::Leaf(leaf) => {
                    let idx = leaf
                        .entries
                        .binary_search_by(|(k, _)| self.context.compare(k, key))
                        .ok()?;
                    return Some(&leaf.entries[idx].1);
                }
                Page::Interior(node) => {
                    page = node.children[node.child_index(key, &self.context)].as_ref();
                }
            }
        }
    }

    /// Returns true if the key is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// The least entry, or `None` on an empty map.
    pub fn first_entry(&self) -> Option<(&K, &V)> {
        self.root.first_entry()
    }

    /// The greatest entry, or `None` on an empty map.
    pub fn last_entry(&self) -> Option<(&K, &V)> {
        self.root.last_entry()
    }

    /// The least entry strictly greater than `key`. The seed key need not be
    /// present.
    pub fn next_entry(&self, key: &K) -> Option<(&K, &V)> {
        Self::next_in(&self.root, key, &self.context)
    }

    fn next_in<'a>(
        page: &'a Page<K, V>,
        key: &K,
        context: &TreeContext<K>,
    ) -> Option<(&'a K, &'a V)> {
        match page {
            Page::Leaf(leaf) => {
                let idx = leaf
                    .entries
                    .partition_point(|(k, _)| context.compare(k, key) != Ordering::Greater);
                leaf.entries.get(idx).map(|(k, v)| (k, v))
            }
            Page::Interior(node) => {
                let idx = node.child_index(key, context);
                Self::next_in(&node.children[idx], key, context)
                    .or_else(|| node.children.get(idx + 1)?.first_entry())
            }
        }
    }

    /// The greatest entry strictly less than `key`. The seed key need not be
    /// present.
    pub fn previous_entry(&self, key: &K) -> Option<(&K, &V)> {
        Self::previous_in(&self.root, key, &self.context)
    }

    fn previous_in<'a>(
        page: &'a Page<K, V>,
        key: &K,
        context: &TreeContext<K>,
    ) -> Option<(&'a K, &'a V)> {
        match page {
            Page::Leaf(leaf) => {
                let idx = leaf
                    .entries
                    .partition_point(|(k, _)| context.compare(k, key) == Ordering::Less);
                if idx == 0 {
                    None
                } else {
                    leaf.entries.get(idx - 1).map(|(k, v)| (k, v))
                }
            }
            Page::Interior(node) => {
                let idx = node.child_index(key, context);
                Self::previous_in(&node.children[idx], key, context).or_else(|| {
                    if idx == 0 {
                        None
                    } else {
                        node.children[idx - 1].last_entry()
                    }
                })
            }
        }
    }

    /// In-order iterator over entries.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            stack: vec![(self.root.as_ref(), 0)],
        }
    }
}

impl<K: Clone, V: Clone> OrderedMap<K, V> {
    /// A new map with `key` bound to `value`. O(log n); the result differs
    /// from `self` only along the path to the key.
    #[must_use]
    pub fn updated(&self, key: K, value: V) -> Self {
        let root = match Self::update_in(&self.root, key, value, &self.context) {
            Updated::Single(page) => page,
            Updated::Split(left, separator, right) => {
                Page::interior(vec![separator], vec![left, right])
            }
        };
        Self {
            root,
            context: self.context.clone(),
        }
    }

    fn update_in(
        page: &Arc<Page<K, V>>,
        key: K,
        value: V,
        context: &TreeContext<K>,
    ) -> Updated<K, V> {
        match page.as_ref() {
            Page::Leaf(leaf) => {
                let mut entries = leaf.entries.clone();
                match entries.binary_search_by(|(k, _)| context.compare(k, &key)) {
                    Ok(idx) => entries[idx] = (key, value),
                    Err(idx) => entries.insert(idx, (key, value)),
                }
                Self::split_leaf(entries, context)
            }
            Page::Interior(node) => {
                let idx = node.child_index(&key, context);
                let mut children = node.children.clone();
                let mut separators = node.separators.clone();
                match Self::update_in(&children[idx], key, value, context) {
                    Updated::Single(child) => children[idx] = child,
                    Updated::Split(left, separator, right) => {
                        children[idx] = left;
                        children.insert(idx + 1, right);
                        separators.insert(idx, separator);
                    }
                }
                Self::split_interior(separators, children, context)
            }
        }
    }

    fn split_leaf(entries: Vec<(K, V)>, context: &TreeContext<K>) -> Updated<K, V> {
        if entries.len() <= context.split_at() {
            return Updated::Single(Page::leaf(entries));
        }
        let mut entries = entries;
        let right = entries.split_off(entries.len() / 2);
        let separator = right[0].0.clone();
        Updated::Split(Page::leaf(entries), separator, Page::leaf(right))
    }

    fn split_interior(
        separators: Vec<K>,
        children: Vec<Arc<Page<K, V>>>,
        context: &TreeContext<K>,
    ) -> Updated<K, V> {
        if children.len() <= context.split_at() {
            return Updated::Single(Page::interior(separators, children));
        }
        let mut separators = separators;
        let mut children = children;
        let mid = children.len() / 2;
        let right_children = children.split_off(mid);
        let mut right_separators = separators.split_off(mid - 1);
        let promoted = right_separators.remove(0);
        Updated::Split(
            Page::interior(separators, children),
            promoted,
            Page::interior(right_separators, right_children),
        )
    }

    /// A new map without `key`. Returns a clone of `self` when the key is
    /// absent. Emptied leaves are collapsed; underfull pages are not merged.
    #[must_use]
    pub fn removed(&self, key: &K) -> Self {
        match Self::remove_in(&self.root, key, &self.context) {
            Some(root) => Self {
                root,
                context: self.context.clone(),
            },
            None => self.clone(),
        }
    }

    fn remove_in(
        page: &Arc<Page<K, V>>,
        key: &K,
        context: &TreeContext<K>,
    ) -> Option<Arc<Page<K, V>>> {
        match page.as_ref() {
            Page::Leaf(leaf) => {
                let idx = leaf
                    .entries
                    .binary_search_by(|(k, _)| context.compare(k, key))
                    .ok()?;
                let mut entries = leaf.entries.clone();
                entries.remove(idx);
                Some(Page::leaf(entries))
            }
            Page::Interior(node) => {
                let idx = node.child_index(key, context);
                let child = Self::remove_in(&node.children[idx], key, context)?;
                let mut children = node.children.clone();
                let mut separators = node.separators.clone();
                if child.len() == 0 {
                    children.remove(idx);
                    separators.remove(idx.saturating_sub(1));
                } else {
                    if idx > 0 {
                        // Removal may have taken the child's least key; the
                        // separator must stay equal to it.
                        let (min, _) = child.first_entry().expect("nonempty child");
                        separators[idx - 1] = min.clone();
                    }
                    children[idx] = child;
                }
                Some(match children.len() {
                    0 => Page::leaf(Vec::new()),
                    1 => children.pop().expect("one child"),
                    _ => Page::interior(separators, children),
                })
            }
        }
    }

    /// The first `n` entries as a new map, sharing every subtree that lies
    /// wholly inside the cut. Panics if `n` exceeds the map length.
    #[must_use]
    pub fn taken(&self, n: usize) -> Self {
        assert!(n <= self.len(), "taken past tree bounds: {n} > {}", self.len());
        let root = if n == 0 {
            Page::leaf(Vec::new())
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

    /// Everything but the first `n` entries as a new map. Panics if `n`
    /// exceeds the map length.
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
            Page::leaf(Vec::new())
        } else {
            Self::drop_in(&self.root, n)
        };
        Self {
            root,
            context: self.context.clone(),
        }
    }

    /// Keep the first `n` entries of a subtree; `0 < n < page.len()`.
    fn take_in(page: &Arc<Page<K, V>>, n: usize) -> Arc<Page<K, V>> {
        match page.as_ref() {
            Page::Leaf(leaf) => Page::leaf(leaf.entries[..n].to_vec()),
            Page::Interior(node) => {
                let mut children = Vec::new();
                let mut remaining = n;
                for child in &node.children {
                    if remaining == 0 {
                        break;
                    }
                    if child.len() <= remaining {
                        remaining -= child.len();
                        children.push(child.clone());
                    } else {
                        children.push(Self::take_in(child, remaining));
                        remaining = 0;
                    }
                }
                if children.len() == 1 {
                    return children.pop().expect("one child");
                }
                let separators = node.separators[..children.len() - 1].to_vec();
                Page::interior(separators, children)
            }
        }
    }

    /// Drop the first `n` entries of a subtree; `0 < n < page.len()`.
    fn drop_in(page: &Arc<Page<K, V>>, n: usize) -> Arc<Page<K, V>> {
        match page.as_ref() {
            Page::Leaf(leaf) => Page::leaf(leaf.entries[n..].to_vec()),
            Page::Interior(node) => {
                let mut remaining = n;
                let mut first = 0;
                while node.children[first].len() <= remaining {
                    remaining -= node.children[first].len();
                    first += 1;
                }
                let mut children = Vec::with_capacity(node.children.len() - first);
                if remaining > 0 {
                    children.push(Self::drop_in(&node.children[first], remaining));
                } else {
                    children.push(node.children[first].clone());
                }
                children.extend(node.children[first + 1..].iter().cloned());
                if children.len() == 1 {
                    return children.pop().expect("one child");
                }
                let separators = node.separators[first..].to_vec();
                Page::interior(separators, children)
            }
        }
    }
}

impl<K, V> OrderedMap<K, V> {
    /// Fold every entry with an associative operator, memoizing the fold per
    /// page. Repeated folds over an unchanged tree are O(1) amortized:
    /// mutation always returns new pages with empty memos, so invalidation
    /// is implicit and shared subtrees keep their cached folds.
    ///
    /// `accumulate` and `combine` must be pure and associative, and every
    /// call against a given tree must use the same operator, or memoized
    /// partial folds become incorrect after structural reuse.
    pub fn reduced<U>(
        &self,
        identity: U,
        accumulate: impl Fn(U, &K, &V) -> U,
        combine: impl Fn(U, U) -> U,
    ) -> U
    where
        U: Clone + Send + Sync + 'static,
    {
        Self::fold_page(&self.root, &identity, &accumulate, &combine)
    }

    fn fold_page<U>(
        page: &Page<K, V>,
        identity: &U,
        accumulate: &impl Fn(U, &K, &V) -> U,
        combine: &impl Fn(U, U) -> U,
    ) -> U
    where
        U: Clone + Send + Sync + 'static,
    {
        if let Some(memo) = page.memo().get() {
            if let Some(value) = memo.downcast_ref::<U>() {
                return value.clone();
            }
        }
        let value = match page {
            Page::Leaf(leaf) => leaf
                .entries
                .iter()
                .fold(identity.clone(), |acc, (k, v)| accumulate(acc, k, v)),
            Page::Interior(node) => node
                .children
                .iter()
                .map(|child| Self::fold_page(child, identity, accumulate, combine))
                .fold(identity.clone(), |acc, part| combine(acc, part)),
        };
        let _ = page.memo().set(Box::new(value.clone()));
        value
    }
}

impl<K: Ord + Clone + 'static, V: Clone> FromIterator<(K, V)> for OrderedMap<K, V> {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Self::new(), |map, (k, v)| map.updated(k, v))
    }
}

/// In-order entry iterator. Pages are walked with an explicit stack; the map
/// is untouched.
pub struct Iter<'a, K, V> {
    stack: Vec<(&'a Page<K, V>, usize)>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (page, idx) = self.stack.pop()?;
            match page {
                Page::Leaf(leaf) => {
                    if let Some((k, v)) = leaf.entries.get(idx) {
                        self.stack.push((page, idx + 1));
                        return Some((k, v));
                    }
                }
                Page::Interior(node) => {
                    if let Some(child) = node.children.get(idx) {
                        self.stack.push((page, idx + 1));
                        self.stack.push((child.as_ref(), 0));
                    }
                }
            }
        }
    }
}

impl<'a, K, V> IntoIterator for &'a OrderedMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for OrderedMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for OrderedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn small_context() -> Arc<TreeContext<i32>> {
        Arc::new(TreeContext::default().with_split_at(4))
    }

    fn sequential(n: i32, context: Arc<TreeContext<i32>>) -> OrderedMap<i32, i32> {
        (0..n).fold(OrderedMap::with_context(context), |m, i| {
            m.updated(i, i * 10)
        })
    }

    #[test]
    fn test_get_and_absence() {
        let m = sequential(100, small_context());
        assert_eq!(m.get(&42), Some(&420));
        assert_eq!(m.get(&100), None);
        assert!(m.contains_key(&0));
        assert!(!m.contains_key(&-1));
    }

    #[test]
    fn test_update_is_persistent() {
        let m = sequential(50, small_context());
        let m2 = m.updated(25, 999);
        assert_eq!(m.get(&25), Some(&250));
        assert_eq!(m2.get(&25), Some(&999));
        assert_eq!(m.len(), m2.len());
    }

    #[test]
    fn test_update_then_remove_roundtrip() {
        let m = sequential(30, small_context());
        let m2 = m.updated(100, 1).removed(&100);
        assert_eq!(m, m2);
        // Removing a pre-existing binding leaves the original untouched.
        let m3 = m.removed(&10);
        assert_eq!(m.get(&10), Some(&100));
        assert_eq!(m3.get(&10), None);
        assert_eq!(m3.len(), m.len() - 1);
    }

    #[test]
    fn test_untouched_subtrees_are_shared() {
        let m = sequential(200, small_context());
        let m2 = m.updated(0, -1);
        let (Page::Interior(a), Page::Interior(b)) = (m.root.as_ref(), m2.root.as_ref()) else {
            panic!("expected interior roots");
        };
        assert_eq!(a.children.len(), b.children.len());
        // Only the leftmost spine changes; every sibling subtree is the same
        // allocation.
        assert!(!Arc::ptr_eq(&a.children[0], &b.children[0]));
        for (left, right) in a.children.iter().zip(&b.children).skip(1) {
            assert!(Arc::ptr_eq(left, right));
        }
    }

    #[test]
    fn test_inorder_traversal_strictly_increasing() {
        let context = small_context();
        let mut m = OrderedMap::with_context(context);
        for i in [5, 1, 9, 3, 7, 2, 8, 0, 6, 4, 11, 15, 13, 12, 10, 14] {
            m = m.updated(i, i);
        }
        let keys: Vec<i32> = m.iter().map(|(k, _)| *k).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(keys.len(), 16);
    }

    #[test]
    fn test_split_keeps_leaf_arity_in_bounds() {
        let split_at = 4;
        let m = sequential(257, Arc::new(TreeContext::default().with_split_at(split_at)));
        fn check(page: &Page<i32, i32>, split_at: usize) {
            match page {
                Page::Leaf(leaf) => {
                    assert!(!leaf.entries.is_empty());
                    assert!(leaf.entries.len() <= split_at);
                }
                Page::Interior(node) => {
                    assert!(node.children.len() <= split_at);
                    for child in &node.children {
                        check(child, split_at);
                    }
                }
            }
        }
        check(&m.root, split_at);
        assert_eq!(m.len(), 257);
        let keys: Vec<i32> = m.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (0..257).collect::<Vec<_>>());
    }

    #[test]
    fn test_separator_invariant() {
        let m = sequential(300, small_context());
        fn check(page: &Page<i32, i32>) {
            if let Page::Interior(node) = page {
                for (i, separator) in node.separators.iter().enumerate() {
                    let (min, _) = node.children[i + 1].first_entry().expect("nonempty child");
                    assert_eq!(separator, min);
                }
                for child in &node.children {
                    check(child);
                }
            }
        }
        check(&m.root);
    }

    #[test]
    fn test_cursors() {
        let m = sequential(64, small_context());
        assert_eq!(m.first_entry(), Some((&0, &0)));
        assert_eq!(m.last_entry(), Some((&63, &630)));
        assert_eq!(m.next_entry(&10), Some((&11, &110)));
        assert_eq!(m.previous_entry(&10), Some((&9, &90)));
        assert_eq!(m.next_entry(&63), None);
        assert_eq!(m.previous_entry(&0), None);
        // Seeding from an absent key works the same.
        let m = m.removed(&11);
        assert_eq!(m.next_entry(&11), Some((&12, &120)));
        assert_eq!(m.previous_entry(&11), Some((&10, &100)));
    }

    #[test]
    fn test_slicing() {
        let m = sequential(100, small_context());
        let head = m.taken(17);
        let tail = m.dropped(17);
        assert_eq!(head.len(), 17);
        assert_eq!(tail.len(), 83);
        assert_eq!(
            head.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            (0..17).collect::<Vec<_>>()
        );
        assert_eq!(tail.first_entry(), Some((&17, &170)));
        assert_eq!(m.taken(100), m);
        assert!(m.dropped(100).is_empty());
        assert!(m.taken(0).is_empty());
    }

    #[test]
    #[should_panic(expected = "taken past tree bounds")]
    fn test_taken_out_of_bounds_panics() {
        let m = sequential(10, small_context());
        let _ = m.taken(11);
    }

    #[test]
    fn test_fold_memoization() {
        let m = sequential(100, small_context());
        let calls = Cell::new(0usize);
        let sum = m.reduced(
            0i64,
            |acc, _, v| {
                calls.set(calls.get() + 1);
                acc + i64::from(*v)
            },
            |a, b| a + b,
        );
        let first_calls = calls.get();
        assert_eq!(first_calls, 100);
        let sum2 = m.reduced(
            0i64,
            |acc, _, v| {
                calls.set(calls.get() + 1);
                acc + i64::from(*v)
            },
            |a, b| a + b,
        );
        assert_eq!(sum, sum2);
        // The second fold hits the root memo; no entry is re-accumulated.
        assert_eq!(calls.get(), first_calls);
    }

    #[test]
    fn test_fold_reuses_shared_subtrees_after_update() {
        let m = sequential(128, small_context());
        let _ = m.reduced(0i64, |acc, _, v| acc + i64::from(*v), |a, b| a + b);
        let m2 = m.updated(0, 1000);
        let calls = Cell::new(0usize);
        let sum = m2.reduced(
            0i64,
            |acc, _, v| {
                calls.set(calls.get() + 1);
                acc + i64::from(*v)
            },
            |a, b| a + b,
        );
        assert_eq!(sum, (0..128).map(|i| i64::from(i) * 10).sum::<i64>() + 1000);
        // Only the rebuilt spine re-accumulates; shared pages answer from
        // their memo.
        assert!(calls.get() < 128);
    }

    #[test]
    fn test_leaves_collapse_but_never_merge() {
        let context = small_context();
        let full = sequential(64, context);
        let mut m = full.clone();
        for i in 0..63 {
            m = m.removed(&i);
        }
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&63), Some(&630));
        // Emptied leaves collapse away entirely; a lone underfull survivor is
        // kept rather than merged.
        fn leaf_arities(page: &Page<i32, i32>, out: &mut Vec<usize>) {
            match page {
                Page::Leaf(leaf) => out.push(leaf.entries.len()),
                Page::Interior(node) => {
                    for child in &node.children {
                        leaf_arities(child, out);
                    }
                }
            }
        }
        let mut arities = Vec::new();
        leaf_arities(&m.root, &mut arities);
        assert!(arities.iter().all(|&a| a > 0));
    }

    #[test]
    fn test_injected_comparator() {
        let reversed: Arc<TreeContext<i32>> =
            Arc::new(TreeContext::new(|a: &i32, b: &i32| b.cmp(a)).with_split_at(4));
        let mut m = OrderedMap::with_context(reversed);
        for i in 0..20 {
            m = m.updated(i, i);
        }
        let keys: Vec<i32> = m.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (0..20).rev().collect::<Vec<_>>());
        assert_eq!(m.first_entry(), Some((&19, &19)));
    }

    #[test]
    fn test_empty_map() {
        let m: OrderedMap<i32, i32> = OrderedMap::new();
        assert!(m.is_empty());
        assert_eq!(m.get(&0), None);
        assert_eq!(m.first_entry(), None);
        assert_eq!(m.next_entry(&0), None);
        assert_eq!(m.removed(&0), m);
    }
}
