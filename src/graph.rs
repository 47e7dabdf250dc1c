//! The port graph and its coherence protocol.
//!
//! A [`FlowGraph`] owns an arena of port nodes addressed by [`PortId`].
//! Hosts drive it in two phases: mutate a source port (`set_value`,
//! `set_key`, `delete_key`), which *decoheres* the affected downstream ports
//! eagerly but cheaply, then *recohere* the ports they care about with a
//! fresh version number, which pulls recomputation strictly
//! upstream-before-downstream and stamps each recomputed port so no port
//! recomputes twice for the same version.
//!
//! The graph must stay acyclic; that is the caller's obligation. All methods
//! are synchronous and take `&mut self`, so a graph serves one logical thread
//! of control at a time while its tree pages stay freely shared with readers.

use std::sync::Arc;

use slab::Slab;
use tracing::{debug, trace};

use crate::effect::KeyEffect;
use crate::error::FlowError;
use crate::map::OrderedMap;
use crate::node::{KeyedState, PortId, PortKind, PortNode};
use crate::version::Version;

/// Incremental dataflow graph over keys `K` and values `V`.
///
/// # Examples
///
/// ```
/// # use streamflow::{FlowGraph, Version};
/// let mut graph: FlowGraph<String, i64> = FlowGraph::new();
/// let input = graph.map_input();
/// graph.set_key(input, "a".to_string(), 1)?;
/// let a = graph.outlet(input, "a".to_string())?;
/// let doubled = graph.map(a, |v| v * 2)?;
/// graph.recohere(doubled, Version::new(1))?;
/// assert_eq!(graph.get(doubled)?, Some(2));
/// # Ok::<(), streamflow::FlowError>(())
/// ```
pub struct FlowGraph<K, V> {
    nodes: Slab<PortNode<K, V>>,
}

/// What a per-key recompute decided to do with the key's entry.
enum Applied<V> {
    /// Store a freshly derived value.
    Update(V),
    /// Delete the entry.
    Remove,
    /// Leave the state alone; it is already authoritative.
    Keep,
}

impl<V> Applied<V> {
    fn as_effect(&self, stored: KeyEffect) -> KeyEffect {
        match self {
            Applied::Update(_) => KeyEffect::Update,
            Applied::Remove => KeyEffect::Remove,
            Applied::Keep => stored,
        }
    }
}

impl<K, V> Default for FlowGraph<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FlowGraph<K, V> {
    /// An empty graph.
    pub fn new() -> Self {
        Self { nodes: Slab::new() }
    }

    /// Number of live ports, derived key outlets included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph holds no ports.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if the handle names a live port.
    pub fn contains(&self, port: PortId) -> bool {
        self.nodes.contains(port.0)
    }

    fn node(&self, port: PortId) -> Result<&PortNode<K, V>, FlowError> {
        self.nodes.get(port.0).ok_or(FlowError::UnknownPort(port))
    }

    fn node_mut(&mut self, port: PortId) -> Result<&mut PortNode<K, V>, FlowError> {
        self.nodes
            .get_mut(port.0)
            .ok_or(FlowError::UnknownPort(port))
    }

    fn keyed(&self, port: PortId) -> Result<&KeyedState<K, V>, FlowError> {
        self.node(port)?
            .kind
            .keyed()
            .ok_or(FlowError::NotKeyed(port))
    }

    fn keyed_mut(&mut self, port: PortId) -> Result<&mut KeyedState<K, V>, FlowError> {
        self.nodes
            .get_mut(port.0)
            .ok_or(FlowError::UnknownPort(port))?
            .kind
            .keyed_mut()
            .ok_or(FlowError::NotKeyed(port))
    }

    /// The port's coherence version; [`Version::STALE`] after a decohere.
    pub fn version(&self, port: PortId) -> Result<Version, FlowError> {
        Ok(self.node(port)?.version)
    }
}

impl<K: Ord + Clone + 'static, V: Clone + 'static> FlowGraph<K, V> {
    // ---- construction ---------------------------------------------------

    /// A terminal scalar source, driven by [`FlowGraph::set_value`].
    pub fn value_input(&mut self) -> PortId {
        PortId(self.nodes.insert(PortNode::new(PortKind::ValueInput {
            value: None,
        })))
    }

    /// A terminal keyed source, driven by [`FlowGraph::set_key`] and
    /// [`FlowGraph::delete_key`].
    pub fn map_input(&mut self) -> PortId {
        let keyed = KeyedState::new(OrderedMap::new());
        PortId(self.nodes.insert(PortNode::new(PortKind::MapInput(keyed))))
    }

    fn insert_bound(
        &mut self,
        source: PortId,
        kind: PortKind<K, V>,
    ) -> Result<PortId, FlowError> {
        self.node(source)?;
        let id = PortId(self.nodes.insert(PortNode::new(kind)));
        match self.bind(source, id) {
            Ok(()) => Ok(id),
            Err(error) => {
                self.nodes.remove(id.0);
                Err(error)
            }
        }
    }

    /// A pure projection of a scalar source. The function runs on every
    /// `get`; put a [`FlowGraph::memoize`] downstream when that is too often.
    pub fn map(
        &mut self,
        source: PortId,
        f: impl Fn(&V) -> V + Send + Sync + 'static,
    ) -> Result<PortId, FlowError> {
        self.insert_bound(source, PortKind::Map { f: Arc::new(f) })
    }

    /// Caches the scalar source's value per version, so repeated `get` calls
    /// skip upstream evaluation until the next recompute.
    pub fn memoize(&mut self, source: PortId) -> Result<PortId, FlowError> {
        self.insert_bound(source, PortKind::Memoize { value: None })
    }

    /// Arrange `f` to run on every recompute of `source` and return `source`
    /// itself. A failing observer surfaces as [`FlowError::Watch`] from the
    /// recohere that triggered it and leaves the observing port stale, so
    /// the next recohere for the same version retries it.
    pub fn watch(
        &mut self,
        source: PortId,
        f: impl Fn(&V) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<PortId, FlowError> {
        self.insert_bound(source, PortKind::Watch { f: Arc::new(f) })?;
        Ok(source)
    }

    /// Whole-map counterpart of [`FlowGraph::watch`] for keyed sources; the
    /// observer sees the source's full state on every recompute.
    pub fn watch_map(
        &mut self,
        source: PortId,
        f: impl Fn(&OrderedMap<K, V>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<PortId, FlowError> {
        self.insert_bound(source, PortKind::WatchMap { f: Arc::new(f) })?;
        Ok(source)
    }

    /// A keyed relay deriving each entry of `source` through `f`.
    pub fn map_entries(
        &mut self,
        source: PortId,
        f: impl Fn(&K, &V) -> V + Send + Sync + 'static,
    ) -> Result<PortId, FlowError> {
        self.insert_bound(
            source,
            PortKind::MapRelay {
                keyed: KeyedState::new(OrderedMap::new()),
                transform: Some(Arc::new(f)),
                retain: None,
            },
        )
    }

    /// A keyed relay keeping only the entries of `source` that satisfy
    /// `keep`. A pending update to an entry that stops satisfying `keep` is
    /// promoted to a removal, so dependents never observe the filtered-out
    /// value.
    pub fn filter_entries(
        &mut self,
        source: PortId,
        keep: impl Fn(&K, &V) -> bool + Send + Sync + 'static,
    ) -> Result<PortId, FlowError> {
        self.insert_bound(
            source,
            PortKind::MapRelay {
                keyed: KeyedState::new(OrderedMap::new()),
                transform: None,
                retain: Some(Arc::new(keep)),
            },
        )
    }

    /// The scalar outlet tracking one key of a keyed port, created on first
    /// request and cached; repeated calls return the same handle. The outlet
    /// is removed automatically when its last output unbinds.
    pub fn outlet(&mut self, port: PortId, key: K) -> Result<PortId, FlowError> {
        if let Some(id) = self.keyed(port)?.outlets.get(&key) {
            return Ok(*id);
        }
        let (value, version) = {
            let node = self.node(port)?;
            let keyed = node.kind.keyed().ok_or(FlowError::NotKeyed(port))?;
            (keyed.state.get(&key).cloned(), node.version)
        };
        let mut node = PortNode::new(PortKind::Key {
            key: key.clone(),
            value,
        });
        node.input = Some(port);
        // Born coherent with its parent; a pending effect on the parent
        // shows up here as the parent's stale version.
        node.version = version;
        let id = PortId(self.nodes.insert(node));
        let keyed = self.keyed_mut(port)?;
        keyed.outlets = keyed.outlets.updated(key, id);
        Ok(id)
    }

    // ---- binding --------------------------------------------------------

    /// Bind `sink`'s inlet to `source`'s outlet and decohere `sink`.
    ///
    /// Keyed sinks take keyed sources and scalar sinks take scalar sources;
    /// a sink's capability is fixed at construction, so a mismatch is
    /// [`FlowError::IncompatibleBinding`]. An inlet holds at most one input.
    pub fn bind(&mut self, source: PortId, sink: PortId) -> Result<(), FlowError> {
        let source_keyed = self.node(source)?.kind.is_keyed();
        {
            let node = self.node(sink)?;
            if node.kind.is_source() {
                return Err(FlowError::IncompatibleBinding { source, sink });
            }
            if let Some(bound) = node.input {
                return Err(FlowError::AlreadyBound { port: sink, bound });
            }
            if node.kind.wants_keyed_input() != source_keyed {
                return Err(FlowError::IncompatibleBinding { source, sink });
            }
        }
        debug!(%source, %sink, "bind");
        self.node_mut(source)?.outputs.push(sink);
        self.node_mut(sink)?.input = Some(source);
        self.decohere(sink)
    }

    /// Unbind `sink`'s inlet from `source`'s outlet. `sink` is left unbound
    /// and stale. A derived key outlet losing its last output is removed.
    pub fn unbind(&mut self, source: PortId, sink: PortId) -> Result<(), FlowError> {
        if self.node(sink)?.input != Some(source) {
            return Err(FlowError::NotBound {
                port: sink,
                input: source,
            });
        }
        debug!(%source, %sink, "unbind");
        self.node_mut(sink)?.input = None;
        let src = self.node_mut(source)?;
        src.outputs.retain(|&p| p != sink);
        let drop_outlet =
            matches!(src.kind, PortKind::Key { .. }) && src.outputs.is_empty();
        self.decohere(sink)?;
        if drop_outlet {
            self.remove_outlet(source)?;
        }
        Ok(())
    }

    /// Detach a key outlet from its parent's cache and free it.
    fn remove_outlet(&mut self, outlet: PortId) -> Result<(), FlowError> {
        let (parent, key) = match &self.node(outlet)?.kind {
            PortKind::Key { key, .. } => (self.node(outlet)?.input, key.clone()),
            _ => return Ok(()),
        };
        if let Some(parent) = parent {
            if let Some(keyed) = self.node_mut(parent)?.kind.keyed_mut() {
                keyed.outlets = keyed.outlets.removed(&key);
            }
        }
        debug!(port = %outlet, "drop key outlet");
        self.nodes.remove(outlet.0);
        Ok(())
    }

    /// Remove a port. Its own inlet is severed automatically, but removal is
    /// refused with [`FlowError::StillBound`] while any output (or any of a
    /// keyed port's outlets' outputs) is still bound; dependents must be
    /// unbound first so they never hold a dangling input.
    pub fn remove(&mut self, port: PortId) -> Result<(), FlowError> {
        {
            let node = self.node(port)?;
            if !node.outputs.is_empty() {
                return Err(FlowError::StillBound(port));
            }
        }
        let outlets: Vec<PortId> = self
            .node(port)?
            .kind
            .keyed()
            .map(|keyed| keyed.outlets.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default();
        for id in &outlets {
            if !self.node(*id)?.outputs.is_empty() {
                return Err(FlowError::StillBound(port));
            }
        }
        if matches!(self.node(port)?.kind, PortKind::Key { .. }) {
            return self.remove_outlet(port);
        }
        if let Some(source) = self.node(port)?.input {
            self.node_mut(source)?.outputs.retain(|&p| p != port);
            let drop_outlet = {
                let src = self.node(source)?;
                matches!(src.kind, PortKind::Key { .. }) && src.outputs.is_empty()
            };
            if drop_outlet {
                self.remove_outlet(source)?;
            }
        }
        for id in outlets {
            self.nodes.remove(id.0);
        }
        debug!(%port, "remove");
        self.nodes.remove(port.0);
        Ok(())
    }

    // ---- source mutation ------------------------------------------------

    /// Set a scalar source's value and decohere everything downstream.
    pub fn set_value(&mut self, port: PortId, value: V) -> Result<(), FlowError> {
        match &mut self.node_mut(port)?.kind {
            PortKind::ValueInput { value: slot } => *slot = Some(value),
            PortKind::MapInput(_) => return Err(FlowError::NotScalar(port)),
            _ => return Err(FlowError::NotASource(port)),
        }
        self.decohere(port)
    }

    /// Set one key of a keyed source and decohere that key downstream.
    pub fn set_key(&mut self, port: PortId, key: K, value: V) -> Result<(), FlowError> {
        match &mut self.node_mut(port)?.kind {
            PortKind::MapInput(keyed) => keyed.state = keyed.state.updated(key.clone(), value),
            PortKind::ValueInput { .. } => return Err(FlowError::NotKeyed(port)),
            PortKind::MapRelay { .. } => return Err(FlowError::NotASource(port)),
            _ => return Err(FlowError::NotKeyed(port)),
        }
        self.decohere_key(port, &key, KeyEffect::Update)
    }

    /// Delete one key of a keyed source and decohere the removal downstream.
    /// Deleting an absent key still propagates; downstream removals of an
    /// absent key are no-ops.
    pub fn delete_key(&mut self, port: PortId, key: &K) -> Result<(), FlowError> {
        match &mut self.node_mut(port)?.kind {
            PortKind::MapInput(keyed) => keyed.state = keyed.state.removed(key),
            PortKind::ValueInput { .. } => return Err(FlowError::NotKeyed(port)),
            PortKind::MapRelay { .. } => return Err(FlowError::NotASource(port)),
            _ => return Err(FlowError::NotKeyed(port)),
        }
        self.decohere_key(port, key, KeyEffect::Remove)
    }

    // ---- reads ----------------------------------------------------------

    /// The port's current scalar value, possibly stale; never recomputes
    /// cached state. Absence is `None`, not an error.
    pub fn get(&self, port: PortId) -> Result<Option<V>, FlowError> {
        let node = self.node(port)?;
        match &node.kind {
            PortKind::ValueInput { value }
            | PortKind::Key { value, .. }
            | PortKind::Memoize { value } => Ok(value.clone()),
            PortKind::Map { f } => {
                let Some(input) = node.input else {
                    return Ok(None);
                };
                Ok(self.get(input)?.map(|v| f(&v)))
            }
            PortKind::Watch { .. } => match node.input {
                Some(input) => self.get(input),
                None => Ok(None),
            },
            PortKind::MapInput(_) | PortKind::MapRelay { .. } | PortKind::WatchMap { .. } => {
                Err(FlowError::NotScalar(port))
            }
        }
    }

    /// One key of a keyed port's current state.
    pub fn get_key(&self, port: PortId, key: &K) -> Result<Option<V>, FlowError> {
        Ok(self.keyed(port)?.state.get(key).cloned())
    }

    /// Returns true if the keyed port currently holds `key`.
    pub fn has_key(&self, port: PortId, key: &K) -> Result<bool, FlowError> {
        Ok(self.keyed(port)?.state.contains_key(key))
    }

    /// The keyed port's whole current state. Cheap: the map shares its pages
    /// with the port and survives later graph mutation unchanged.
    pub fn get_map(&self, port: PortId) -> Result<OrderedMap<K, V>, FlowError> {
        Ok(self.keyed(port)?.state.clone())
    }

    // ---- protocol: decohere ---------------------------------------------

    /// Mark `port` stale and fan out to every bound output and cached key
    /// outlet. Never recomputes. An already-stale port short-circuits, which
    /// bounds the fan-out.
    pub fn decohere(&mut self, port: PortId) -> Result<(), FlowError> {
        let (already_stale, newly_dirty) = {
            let node = self.node_mut(port)?;
            let already_stale = node.version.is_stale();
            let newly_dirty = match node.kind.keyed_mut() {
                Some(keyed) if !keyed.all_dirty => {
                    keyed.all_dirty = true;
                    true
                }
                _ => false,
            };
            node.version = Version::STALE;
            (already_stale, newly_dirty)
        };
        // A stale keyed port may still need the whole-view effect spread to
        // outlets its per-key effects never touched.
        if already_stale && !newly_dirty {
            return Ok(());
        }
        trace!(%port, "decohere");
        let outputs = self.node(port)?.outputs.clone();
        let outlets: Vec<PortId> = self
            .node(port)?
            .kind
            .keyed()
            .map(|keyed| keyed.outlets.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default();
        for out in outputs {
            self.decohere(out)?;
        }
        for out in outlets {
            self.decohere(out)?;
        }
        Ok(())
    }

    /// Record a pending effect for one key of a keyed port, mark the port
    /// stale, and fan the key out: keyed outputs receive the same key,
    /// scalar outputs (which cannot discriminate by key) a plain decohere,
    /// and the key's cached outlet a plain decohere. A port already stale
    /// with the same stored effect short-circuits.
    pub fn decohere_key(
        &mut self,
        port: PortId,
        key: &K,
        effect: KeyEffect,
    ) -> Result<(), FlowError> {
        {
            let node = self.node(port)?;
            let keyed = node.kind.keyed().ok_or(FlowError::NotKeyed(port))?;
            if node.version.is_stale() && keyed.effects.get(key) == Some(&effect) {
                return Ok(());
            }
        }
        trace!(%port, ?effect, "decohere key");
        let outlet = {
            let node = self.node_mut(port)?;
            node.version = Version::STALE;
            let keyed = node.kind.keyed_mut().ok_or(FlowError::NotKeyed(port))?;
            keyed.effects = keyed.effects.updated(key.clone(), effect);
            keyed.outlets.get(key).copied()
        };
        let outputs = self.node(port)?.outputs.clone();
        for out in outputs {
            if self.node(out)?.kind.is_keyed() {
                self.decohere_key(out, key, effect)?;
            } else {
                self.decohere(out)?;
            }
        }
        if let Some(outlet) = outlet {
            self.decohere(outlet)?;
        }
        Ok(())
    }

    // ---- protocol: recohere ---------------------------------------------

    /// Bring `port` up to `version`: pull its input to the same version,
    /// recompute local state, stamp the version, then propagate to every
    /// bound output and cached key outlet. A port already at `version` is a
    /// no-op, so repeated pulls within one pass do no repeated work.
    pub fn recohere(&mut self, port: PortId, version: Version) -> Result<(), FlowError> {
        if self.node(port)?.version == version {
            return Ok(());
        }
        trace!(%port, %version, "recohere");
        enum Pull<K> {
            None,
            Whole(PortId),
            Keyed(PortId, K),
        }
        let pull = {
            let node = self.node(port)?;
            match (&node.kind, node.input) {
                (PortKind::Key { key, .. }, Some(input)) => Pull::Keyed(input, key.clone()),
                (_, Some(input)) => Pull::Whole(input),
                (_, None) => Pull::None,
            }
        };
        match pull {
            Pull::Whole(input) => self.recohere(input, version)?,
            Pull::Keyed(input, key) => self.recohere_key(input, &key, version)?,
            Pull::None => {}
        }
        // The upstream pull may have recohered this port reentrantly.
        if self.node(port)?.version == version {
            return Ok(());
        }
        if self.node(port)?.kind.is_keyed() {
            let pending: Vec<K> = self
                .keyed(port)?
                .effects
                .iter()
                .map(|(key, _)| key.clone())
                .collect();
            for key in pending {
                self.recohere_key(port, &key, version)?;
            }
            if self.node(port)?.version == version {
                return Ok(());
            }
            if self.keyed(port)?.all_dirty {
                self.rebuild_keyed(port)?;
            }
            self.keyed_mut(port)?.all_dirty = false;
        } else {
            self.recompute_scalar(port)?;
        }
        let node = self.node_mut(port)?;
        node.version = version;
        let outputs = node.outputs.clone();
        let outlets: Vec<PortId> = node
            .kind
            .keyed()
            .map(|keyed| keyed.outlets.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default();
        if let Err(error) = self.propagate_recohere(outputs, outlets, version) {
            // Revert to stale so a retry for the same version propagates
            // again and reaches the dependent that failed.
            self.node_mut(port)?.version = Version::STALE;
            return Err(error);
        }
        Ok(())
    }

    fn propagate_recohere(
        &mut self,
        outputs: Vec<PortId>,
        outlets: Vec<PortId>,
        version: Version,
    ) -> Result<(), FlowError> {
        for out in outputs {
            self.recohere(out, version)?;
        }
        for out in outlets {
            self.recohere(out, version)?;
        }
        Ok(())
    }

    /// Bring one key of a keyed port up to `version`. A no-op unless the
    /// port is stale with an effect pending for `key`. Pulls the input's
    /// same key first, runs the retain hook (which may promote an update to
    /// a removal and re-decoheres dependents before applying), applies the
    /// effect, then propagates to keyed outputs and the key's outlet. The
    /// port's own version is stamped only by a whole [`FlowGraph::recohere`].
    pub fn recohere_key(
        &mut self,
        port: PortId,
        key: &K,
        version: Version,
    ) -> Result<(), FlowError> {
        {
            let node = self.node(port)?;
            if node.version == version {
                return Ok(());
            }
            let keyed = node.kind.keyed().ok_or(FlowError::NotKeyed(port))?;
            if !keyed.effects.contains_key(key) {
                return Ok(());
            }
        }
        trace!(%port, %version, "recohere key");
        if let Some(input) = self.node(port)?.input {
            self.recohere_key(input, key, version)?;
        }
        // The upstream pull propagates back down; the effect may be gone.
        let Some(stored) = self.keyed(port)?.effects.get(key).copied() else {
            return Ok(());
        };
        let applied = self.apply_key_effect(port, key, stored)?;
        if applied.as_effect(stored) != stored {
            let outputs = self.node(port)?.outputs.clone();
            for out in outputs {
                if self.node(out)?.kind.is_keyed() {
                    self.decohere_key(out, key, applied.as_effect(stored))?;
                }
            }
        }
        let keyed = self.keyed_mut(port)?;
        keyed.effects = keyed.effects.removed(key);
        match applied {
            Applied::Update(value) => keyed.state = keyed.state.updated(key.clone(), value),
            Applied::Remove => keyed.state = keyed.state.removed(key),
            Applied::Keep => {}
        }
        let outputs = self.node(port)?.outputs.clone();
        for out in outputs {
            if self.node(out)?.kind.is_keyed() {
                self.recohere_key(out, key, version)?;
            }
        }
        if let Some(outlet) = self.keyed(port)?.outlets.get(key).copied() {
            self.recohere(outlet, version)?;
        }
        Ok(())
    }

    /// Decide what a pending effect does to this port's entry for `key`.
    fn apply_key_effect(
        &self,
        port: PortId,
        key: &K,
        stored: KeyEffect,
    ) -> Result<Applied<V>, FlowError> {
        let node = self.node(port)?;
        match &node.kind {
            // A source's state is authoritative; the effect only existed to
            // drive propagation.
            PortKind::MapInput(_) => Ok(Applied::Keep),
            PortKind::MapRelay {
                transform, retain, ..
            } => {
                if stored == KeyEffect::Remove {
                    return Ok(Applied::Remove);
                }
                let Some(input) = node.input else {
                    return Ok(Applied::Remove);
                };
                // An update whose upstream entry is gone is a removal.
                let Some(value) = self.get_key(input, key)? else {
                    return Ok(Applied::Remove);
                };
                if let Some(retain) = retain {
                    if !retain(key, &value) {
                        return Ok(Applied::Remove);
                    }
                }
                let derived = match transform {
                    Some(transform) => transform(key, &value),
                    None => value,
                };
                Ok(Applied::Update(derived))
            }
            _ => Err(FlowError::NotKeyed(port)),
        }
    }

    /// Rebuild a keyed port's whole state from its input; the whole-view
    /// counterpart of a per-key effect.
    fn rebuild_keyed(&mut self, port: PortId) -> Result<(), FlowError> {
        let (input, transform, retain) = {
            let node = self.node(port)?;
            match &node.kind {
                PortKind::MapInput(_) => return Ok(()),
                PortKind::MapRelay {
                    transform, retain, ..
                } => (node.input, transform.clone(), retain.clone()),
                _ => return Err(FlowError::NotKeyed(port)),
            }
        };
        let state = match input {
            Some(input) => {
                let upstream = self.get_map(input)?;
                let mut state = OrderedMap::new();
                for (key, value) in &upstream {
                    if retain.as_ref().is_some_and(|keep| !keep(key, value)) {
                        continue;
                    }
                    let derived = match &transform {
                        Some(transform) => transform(key, value),
                        None => value.clone(),
                    };
                    state = state.updated(key.clone(), derived);
                }
                state
            }
            None => OrderedMap::new(),
        };
        let keyed = self.keyed_mut(port)?;
        keyed.state = state;
        // The rebuild supersedes any per-key effects that survived.
        keyed.effects = OrderedMap::new();
        Ok(())
    }

    /// Recompute a scalar port's cached state for a recohere.
    fn recompute_scalar(&mut self, port: PortId) -> Result<(), FlowError> {
        enum Recompute<K, V> {
            Nothing,
            Cache(Option<PortId>),
            CacheKey(PortId, K),
            Observe(Option<PortId>, Arc<dyn Fn(&V) -> anyhow::Result<()> + Send + Sync>),
            ObserveMap(
                Option<PortId>,
                Arc<dyn Fn(&OrderedMap<K, V>) -> anyhow::Result<()> + Send + Sync>,
            ),
        }
        let plan = {
            let node = self.node(port)?;
            match &node.kind {
                PortKind::ValueInput { .. } | PortKind::Map { .. } => Recompute::Nothing,
                PortKind::Memoize { .. } => Recompute::Cache(node.input),
                PortKind::Key { key, .. } => match node.input {
                    Some(input) => Recompute::CacheKey(input, key.clone()),
                    None => Recompute::Nothing,
                },
                PortKind::Watch { f } => Recompute::Observe(node.input, f.clone()),
                PortKind::WatchMap { f } => Recompute::ObserveMap(node.input, f.clone()),
                PortKind::MapInput(_) | PortKind::MapRelay { .. } => {
                    return Err(FlowError::NotScalar(port))
                }
            }
        };
        match plan {
            Recompute::Nothing => {}
            Recompute::Cache(input) => {
                let value = match input {
                    Some(input) => self.get(input)?,
                    None => None,
                };
                if let PortKind::Memoize { value: slot } = &mut self.node_mut(port)?.kind {
                    *slot = value;
                }
            }
            Recompute::CacheKey(input, key) => {
                let value = self.get_key(input, &key)?;
                if let PortKind::Key { value: slot, .. } = &mut self.node_mut(port)?.kind {
                    *slot = value;
                }
            }
            Recompute::Observe(input, f) => {
                let value = match input {
                    Some(input) => self.get(input)?,
                    None => None,
                };
                if let Some(value) = value {
                    f(&value).map_err(|error| FlowError::Watch {
                        port,
                        error: Arc::new(error),
                    })?;
                }
            }
            Recompute::ObserveMap(input, f) => {
                if let Some(input) = input {
                    let map = self.get_map(input)?;
                    f(&map).map_err(|error| FlowError::Watch {
                        port,
                        error: Arc::new(error),
                    })?;
                }
            }
        }
        Ok(())
    }
}

impl<K, V> std::fmt::Debug for FlowGraph<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowGraph")
            .field("ports", &self.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_value_input_roundtrip() {
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.value_input();
        assert_eq!(graph.get(input).unwrap(), None);
        graph.set_value(input, 7).unwrap();
        assert_eq!(graph.get(input).unwrap(), Some(7));
        assert!(graph.version(input).unwrap().is_stale());
        graph.recohere(input, Version::new(1)).unwrap();
        assert_eq!(graph.version(input).unwrap(), Version::new(1));
    }

    #[test]
    fn test_unknown_port() {
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.value_input();
        graph.remove(input).unwrap();
        assert!(matches!(
            graph.get(input),
            Err(FlowError::UnknownPort(p)) if p == input
        ));
    }

    #[test]
    fn test_bind_compatibility() {
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let scalar = graph.value_input();
        let keyed = graph.map_input();
        assert!(matches!(
            graph.map_entries(scalar, |_, v| *v),
            Err(FlowError::IncompatibleBinding { .. })
        ));
        assert!(matches!(
            graph.map(keyed, |v| *v),
            Err(FlowError::IncompatibleBinding { .. })
        ));
        // Failed constructors leave no orphan ports behind.
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_single_inlet() {
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let a = graph.value_input();
        let b = graph.value_input();
        let mapped = graph.map(a, |v| v + 1).unwrap();
        assert!(matches!(
            graph.bind(b, mapped),
            Err(FlowError::AlreadyBound { .. })
        ));
        graph.unbind(a, mapped).unwrap();
        graph.bind(b, mapped).unwrap();
        graph.set_value(b, 1).unwrap();
        graph.recohere(mapped, Version::new(1)).unwrap();
        assert_eq!(graph.get(mapped).unwrap(), Some(2));
    }

    #[test]
    fn test_decohere_is_idempotent() {
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.value_input();
        let mapped = graph.map(input, |v| v * 2).unwrap();
        graph.set_value(input, 1).unwrap();
        graph.recohere(mapped, Version::new(1)).unwrap();
        graph.decohere(input).unwrap();
        assert!(graph.version(mapped).unwrap().is_stale());
        // A second decohere before any recohere changes nothing.
        graph.decohere(input).unwrap();
        assert!(graph.version(input).unwrap().is_stale());
        assert!(graph.version(mapped).unwrap().is_stale());
    }

    #[test]
    fn test_recohere_recomputes_once_per_version() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.value_input();
        let mapped = graph.map(input, |v| v + 1).unwrap();
        let memo = graph.memoize(mapped).unwrap();
        let seen = runs.clone();
        graph
            .watch(memo, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        graph.set_value(input, 10).unwrap();
        graph.recohere(memo, Version::new(1)).unwrap();
        assert_eq!(graph.get(memo).unwrap(), Some(11));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // Same version again: every port short-circuits.
        graph.recohere(memo, Version::new(1)).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_memoize_caches_per_version() {
        let evals = Arc::new(AtomicUsize::new(0));
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.value_input();
        let counted = evals.clone();
        let mapped = graph
            .map(input, move |v| {
                counted.fetch_add(1, Ordering::SeqCst);
                v * 3
            })
            .unwrap();
        let memo = graph.memoize(mapped).unwrap();
        graph.set_value(input, 2).unwrap();
        graph.recohere(memo, Version::new(1)).unwrap();
        let before = evals.load(Ordering::SeqCst);
        assert_eq!(graph.get(memo).unwrap(), Some(6));
        assert_eq!(graph.get(memo).unwrap(), Some(6));
        // The memoized port answers gets without re-running the projection.
        assert_eq!(evals.load(Ordering::SeqCst), before);
        assert_eq!(graph.get(mapped).unwrap(), Some(6));
        assert!(evals.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn test_keyed_source_and_outlet() {
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.map_input();
        graph.set_key(input, "a".into(), 1).unwrap();
        graph.set_key(input, "b".into(), 2).unwrap();
        graph.recohere(input, Version::new(1)).unwrap();
        assert_eq!(graph.get_key(input, &"a".into()).unwrap(), Some(1));
        assert!(graph.has_key(input, &"b".into()).unwrap());
        let a = graph.outlet(input, "a".into()).unwrap();
        // The outlet is cached per key.
        assert_eq!(graph.outlet(input, "a".into()).unwrap(), a);
        assert_eq!(graph.get(a).unwrap(), Some(1));
        graph.set_key(input, "a".into(), 5).unwrap();
        assert!(graph.version(a).unwrap().is_stale());
        graph.recohere(a, Version::new(2)).unwrap();
        assert_eq!(graph.get(a).unwrap(), Some(5));
    }

    #[test]
    fn test_delete_key_empties_outlet() {
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.map_input();
        graph.set_key(input, "b".into(), 2).unwrap();
        let b = graph.outlet(input, "b".into()).unwrap();
        graph.recohere(input, Version::new(1)).unwrap();
        assert_eq!(graph.get(b).unwrap(), Some(2));
        graph.delete_key(input, &"b".into()).unwrap();
        graph.recohere(input, Version::new(2)).unwrap();
        assert!(!graph.has_key(input, &"b".into()).unwrap());
        assert_eq!(graph.get(b).unwrap(), None);
    }

    #[test]
    fn test_map_entries_relay() {
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.map_input();
        let relay = graph.map_entries(input, |_, v| v * 10).unwrap();
        graph.set_key(input, "a".into(), 1).unwrap();
        graph.set_key(input, "b".into(), 2).unwrap();
        graph.recohere(relay, Version::new(1)).unwrap();
        assert_eq!(graph.get_key(relay, &"a".into()).unwrap(), Some(10));
        assert_eq!(graph.get_key(relay, &"b".into()).unwrap(), Some(20));
        // Per-key propagation touches only the changed key.
        graph.set_key(input, "a".into(), 3).unwrap();
        graph.recohere(relay, Version::new(2)).unwrap();
        assert_eq!(graph.get_key(relay, &"a".into()).unwrap(), Some(30));
        assert_eq!(graph.get_key(relay, &"b".into()).unwrap(), Some(20));
    }

    #[test]
    fn test_filter_promotes_update_to_remove() {
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.map_input();
        let evens = graph.filter_entries(input, |_, v| v % 2 == 0).unwrap();
        let downstream = graph.map_entries(evens, |_, v| *v).unwrap();
        graph.set_key(input, "x".into(), 2).unwrap();
        graph.recohere(downstream, Version::new(1)).unwrap();
        assert_eq!(graph.get_key(downstream, &"x".into()).unwrap(), Some(2));
        // The update to an odd value must surface downstream as a removal.
        graph.set_key(input, "x".into(), 3).unwrap();
        graph.recohere(downstream, Version::new(2)).unwrap();
        assert!(!graph.has_key(evens, &"x".into()).unwrap());
        assert!(!graph.has_key(downstream, &"x".into()).unwrap());
    }

    #[test]
    fn test_watch_failure_leaves_port_stale_and_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.value_input();
        let counted = attempts.clone();
        let watched = graph
            .watch(input, move |_| {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient failure");
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(watched, input);
        graph.set_value(input, 1).unwrap();
        assert!(matches!(
            graph.recohere(input, Version::new(1)),
            Err(FlowError::Watch { .. })
        ));
        // The observing port kept its stale version, so the same version
        // retries the observer and succeeds.
        graph.recohere(input, Version::new(1)).unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_watch_map_sees_whole_state() {
        let sizes = Arc::new(AtomicUsize::new(0));
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.map_input();
        let seen = sizes.clone();
        graph
            .watch_map(input, move |map| {
                seen.store(map.len(), Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        graph.set_key(input, "a".into(), 1).unwrap();
        graph.set_key(input, "b".into(), 2).unwrap();
        graph.recohere(input, Version::new(1)).unwrap();
        assert_eq!(sizes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_outlet_auto_removed_on_last_unbind() {
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.map_input();
        graph.set_key(input, "a".into(), 1).unwrap();
        let a = graph.outlet(input, "a".into()).unwrap();
        let mapped = graph.map(a, |v| v + 1).unwrap();
        graph.unbind(a, mapped).unwrap();
        assert!(!graph.contains(a));
        // A later request mints a fresh, live outlet.
        let a2 = graph.outlet(input, "a".into()).unwrap();
        assert_eq!(graph.get(a2).unwrap(), Some(1));
    }

    #[test]
    fn test_remove_refuses_bound_port() {
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let input = graph.value_input();
        let mapped = graph.map(input, |v| *v).unwrap();
        assert!(matches!(
            graph.remove(input),
            Err(FlowError::StillBound(p)) if p == input
        ));
        graph.remove(mapped).unwrap();
        graph.remove(input).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_rebind_relay_rebuilds_whole_state() {
        let mut graph: FlowGraph<String, i64> = FlowGraph::new();
        let first = graph.map_input();
        let second = graph.map_input();
        graph.set_key(first, "a".into(), 1).unwrap();
        graph.set_key(second, "z".into(), 9).unwrap();
        let relay = graph.map_entries(first, |_, v| *v).unwrap();
        graph.recohere(relay, Version::new(1)).unwrap();
        assert!(graph.has_key(relay, &"a".into()).unwrap());
        graph.unbind(first, relay).unwrap();
        graph.bind(second, relay).unwrap();
        graph.recohere(relay, Version::new(2)).unwrap();
        assert!(!graph.has_key(relay, &"a".into()).unwrap());
        assert_eq!(graph.get_key(relay, &"z".into()).unwrap(), Some(9));
    }
}
