/// Version is the coherence stamp of a port. A port whose version matches the
/// driver's target version is consistent; [`Version::STALE`] marks a port that
/// has been decohered and awaits recomputation.
///
/// Versions are compared as plain integers: a node recomputed once for version
/// `v` never recomputes again for `v` regardless of how many downstream pulls
/// reach it in the same pass.
///
/// # Examples
///
/// ```
/// # use streamflow::Version;
/// let v = Version::new(3);
/// assert!(!v.is_stale());
/// assert!(Version::STALE.is_stale());
/// assert!(Version::new(4) > v);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(i64);

impl Version {
    /// The stale sentinel. A decohered port carries this version until the
    /// next recohere stamps it.
    pub const STALE: Version = Version(-1);

    /// Create a coherent version. Panics on negative input; negative values
    /// are reserved for the stale sentinel.
    pub fn new(version: i64) -> Self {
        assert!(version >= 0, "negative versions are reserved");
        Version(version)
    }

    /// Returns true if this is the stale sentinel.
    pub fn is_stale(self) -> bool {
        self.0 < 0
    }

    /// The raw version number, `-1` when stale.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for Version {
    fn from(version: i64) -> Self {
        Version::new(version)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_stale() {
            write!(f, "stale")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
