//! Port nodes stored in the graph arena.
//!
//! A node bundles both sides of a port: the inlet (at most one bound input)
//! and the outlet (a fan-out set of bound outputs plus the coherence
//! version). What a node does with the data flowing through it is fixed at
//! construction by its [`PortKind`]; the graph dispatches the protocol over
//! the kind rather than probing capabilities at run time.

use std::sync::Arc;

use crate::effect::KeyEffect;
use crate::map::OrderedMap;
use crate::version::Version;

/// Handle to a port in a [`FlowGraph`](crate::FlowGraph) arena.
///
/// Handles are only meaningful within the graph that issued them and dangle
/// after the port is removed; the graph reports a dangling handle as
/// [`FlowError::UnknownPort`](crate::FlowError::UnknownPort).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub(crate) usize);

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// Shared state of a keyed port (`MapInput` and `MapRelay`).
///
/// `state` is the port's current keyed view. `effects` records which keys are
/// stale and why, last-write-wins per key; `all_dirty` is the whole-view
/// counterpart used when staleness cannot be attributed to a key. `outlets`
/// caches the derived key outlet per requested key so repeated `outlet` calls
/// return the same handle. All three are ordered maps, so per-key work
/// happens in deterministic comparator order.
pub(crate) struct KeyedState<K, V> {
    pub state: OrderedMap<K, V>,
    pub effects: OrderedMap<K, KeyEffect>,
    pub outlets: OrderedMap<K, PortId>,
    pub all_dirty: bool,
}

impl<K: Clone + 'static, V: Clone + 'static> KeyedState<K, V> {
    pub fn new(state: OrderedMap<K, V>) -> Self
    where
        K: Ord,
    {
        Self {
            state,
            effects: OrderedMap::new(),
            outlets: OrderedMap::new(),
            all_dirty: false,
        }
    }
}

/// What a port does with the data flowing through it, fixed at construction.
pub(crate) enum PortKind<K, V> {
    /// Terminal scalar source driven by `set_value`.
    ValueInput { value: Option<V> },

    /// Terminal keyed source driven by `set_key`/`delete_key`; its state map
    /// is authoritative.
    MapInput(KeyedState<K, V>),

    /// Keyed pass-through deriving its state from a keyed input, entry by
    /// entry. `transform` rewrites each value; `retain` drops entries,
    /// promoting a pending `Update` to `Remove` so dependents never observe
    /// a filtered-out value.
    MapRelay {
        keyed: KeyedState<K, V>,
        transform: Option<Arc<dyn Fn(&K, &V) -> V + Send + Sync>>,
        retain: Option<Arc<dyn Fn(&K, &V) -> bool + Send + Sync>>,
    },

    /// Derived scalar outlet tracking one key of its keyed input. Created
    /// lazily by `outlet` and cached on the parent; removed when its last
    /// output unbinds.
    Key { key: K, value: Option<V> },

    /// Pure per-get projection of the upstream scalar value.
    Map { f: Arc<dyn Fn(&V) -> V + Send + Sync> },

    /// Caches the upstream value per version so repeated gets skip upstream
    /// evaluation.
    Memoize { value: Option<V> },

    /// Side-effecting scalar observer; runs on every recompute. Failure
    /// leaves the version unstamped so the observer is retried.
    Watch {
        f: Arc<dyn Fn(&V) -> anyhow::Result<()> + Send + Sync>,
    },

    /// Side-effecting whole-map observer for keyed sources.
    WatchMap {
        f: Arc<dyn Fn(&OrderedMap<K, V>) -> anyhow::Result<()> + Send + Sync>,
    },
}

impl<K, V> PortKind<K, V> {
    /// Keyed ports carry per-key state and accept keyed propagation.
    pub fn is_keyed(&self) -> bool {
        matches!(self, PortKind::MapInput(_) | PortKind::MapRelay { .. })
    }

    /// Sinks that consume a keyed input rather than a scalar one.
    pub fn wants_keyed_input(&self) -> bool {
        matches!(
            self,
            PortKind::MapRelay { .. } | PortKind::Key { .. } | PortKind::WatchMap { .. }
        )
    }

    /// Terminal sources are driven by the host, never bound to an input.
    pub fn is_source(&self) -> bool {
        matches!(self, PortKind::ValueInput { .. } | PortKind::MapInput(_))
    }

    pub fn keyed(&self) -> Option<&KeyedState<K, V>> {
        match self {
            PortKind::MapInput(keyed) | PortKind::MapRelay { keyed, .. } => Some(keyed),
            _ => None,
        }
    }

    pub fn keyed_mut(&mut self) -> Option<&mut KeyedState<K, V>> {
        match self {
            PortKind::MapInput(keyed) | PortKind::MapRelay { keyed, .. } => Some(keyed),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PortKind::ValueInput { .. } => "ValueInput",
            PortKind::MapInput(_) => "MapInput",
            PortKind::MapRelay { .. } => "MapRelay",
            PortKind::Key { .. } => "Key",
            PortKind::Map { .. } => "Map",
            PortKind::Memoize { .. } => "Memoize",
            PortKind::Watch { .. } => "Watch",
            PortKind::WatchMap { .. } => "WatchMap",
        }
    }
}

impl<K, V> std::fmt::Debug for PortKind<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A port node: inlet, outlet fan-out, coherence version, and kind.
pub(crate) struct PortNode<K, V> {
    pub version: Version,
    pub input: Option<PortId>,
    pub outputs: Vec<PortId>,
    pub kind: PortKind<K, V>,
}

impl<K, V> PortNode<K, V> {
    pub fn new(kind: PortKind<K, V>) -> Self {
        Self {
            version: Version::STALE,
            input: None,
            outputs: Vec::new(),
            kind,
        }
    }
}
