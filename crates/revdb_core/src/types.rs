//! Core identifiers: object ids, transaction ids, version ids.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable identity of a persistent object.
///
/// Oids are allocated by the storage and never reused, even after the
/// object has been garbage collected by a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(pub u64);

impl Oid {
    /// The root object. Every database has one; it is never collected.
    pub const ROOT: Oid = Oid(0);

    /// Creates an oid from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for [`Oid::ROOT`].
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == Self::ROOT.0
    }

    /// Big-endian encoding, so byte order matches numeric order.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decodes the big-endian form produced by [`Oid::to_bytes`].
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{:#x}", self.0)
    }
}

/// Commit-ordered transaction id.
///
/// A tid doubles as the commit timestamp: the raw value is the number of
/// microseconds since the Unix epoch at which the transaction began its
/// commit, bumped when needed so that tids are strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tid(pub u64);

/// The tid an in-memory copy of an object reflects.
pub type Serial = Tid;

impl Tid {
    /// The "no revision" tid: serial of never-stored objects, and the
    /// pickle pointer of deletion tombstones.
    pub const ZERO: Tid = Tid(0);

    /// Largest representable tid.
    pub const MAX: Tid = Tid(u64::MAX);

    /// Creates a tid from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for [`Tid::ZERO`].
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Tid for a wall-clock instant. Instants before the epoch map to zero.
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        let micros = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or(0);
        Self(u64::try_from(micros).unwrap_or(u64::MAX))
    }

    /// Tid for the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// The next tid to hand out after `self`: the current time, unless the
    /// clock has not moved past `self`, in which case `self + 1`.
    #[must_use]
    pub fn successor(self) -> Self {
        let now = Self::now();
        if now > self {
            now
        } else {
            self.next()
        }
    }

    /// `self + 1`, saturating.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Big-endian encoding.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decodes the big-endian form produced by [`Tid::to_bytes`].
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Storage-internal id of a named version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionId(pub u64);

impl VersionId {
    /// The non-version (trunk) line.
    pub const NON_VERSION: VersionId = VersionId(0);

    /// Creates a version id from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the non-version line.
    #[must_use]
    pub const fn is_non_version(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vid:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn byte_order_matches_numeric_order() {
        let small = Oid::new(0x00ff);
        let large = Oid::new(0x0100);
        assert!(small < large);
        assert!(small.to_bytes() < large.to_bytes());
        assert_eq!(Oid::from_bytes(large.to_bytes()), large);
    }

    #[test]
    fn tid_from_system_time_is_microseconds() {
        let t = UNIX_EPOCH + Duration::from_micros(1_500);
        assert_eq!(Tid::from_system_time(t), Tid::new(1_500));
    }

    #[test]
    fn successor_always_moves_forward() {
        let far_future = Tid::new(u64::MAX - 10);
        assert_eq!(far_future.successor(), Tid::new(u64::MAX - 9));

        let past = Tid::new(1);
        assert!(past.successor() > past);
    }

    #[test]
    fn display_forms() {
        assert_eq!(Oid::new(255).to_string(), "oid:0xff");
        assert_eq!(Tid::new(7).to_string(), "tid:7");
        assert_eq!(VersionId::new(3).to_string(), "vid:3");
    }

    #[test]
    fn root_and_zero_markers() {
        assert!(Oid::ROOT.is_root());
        assert!(!Oid::new(1).is_root());
        assert!(Tid::ZERO.is_zero());
        assert!(VersionId::NON_VERSION.is_non_version());
    }
}
