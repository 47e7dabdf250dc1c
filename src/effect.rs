/// KeyEffect records why a single key of a keyed port is stale.
///
/// Effects are stored per key in a port's pending-effect map, last-write-wins:
/// a key present in the map means that key's view is stale, absence means it
/// is consistent as of the port's current version. Effects are never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyEffect {
    /// The key's value changed upstream and must be re-derived.
    Update,
    /// The key was removed upstream and must be deleted.
    Remove,
}
