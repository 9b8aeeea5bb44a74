// Copyright 2024 The Cairn Authors
// SPDX-License-Identifier: Apache-2.0

//! Common types shared by the log and store layers.

use serde::{Deserialize, Serialize};

/// An epoch-qualified object version.
///
/// Versions are assigned by the writer that currently owns the placement
/// group: `epoch` is the interval of ownership and `version` a counter within
/// it. Ordering compares the epoch first, so versions from a newer ownership
/// interval always supersede older ones regardless of the counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Eversion {
    /// Ownership interval in which the version was assigned.
    pub epoch: u64,
    /// Counter within the epoch.
    pub version: u64,
}

impl Eversion {
    /// The zero sentinel, ordered before every real version.
    pub const ZERO: Self = Self { epoch: 0, version: 0 };

    /// Creates a version from its parts.
    #[must_use]
    pub const fn new(epoch: u64, version: u64) -> Self {
        Self { epoch, version }
    }

    /// Returns true if this is the zero sentinel.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.epoch == 0 && self.version == 0
    }
}

impl std::fmt::Display for Eversion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}'{}", self.epoch, self.version)
    }
}

/// A snapshot identifier.
///
/// Snapshot ids are allocated monotonically per image. [`SnapId::HEAD`]
/// addresses the writable head rather than any snapshot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SnapId(pub u64);

impl SnapId {
    /// The writable head of an object (not a snapshot).
    pub const HEAD: Self = Self(u64::MAX);

    /// Returns true if this id addresses the head.
    #[must_use]
    pub const fn is_head(&self) -> bool {
        self.0 == u64::MAX
    }
}

impl std::fmt::Display for SnapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_head() {
            write!(f, "head")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identity of an object as tracked by the placement-group log.
///
/// The same name at different snapshot ids denotes distinct recoverable
/// states, so the snapshot id is part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    /// Object name within its pool.
    pub name: String,
    /// Snapshot id, or [`SnapId::HEAD`] for the head object.
    pub snap: SnapId,
}

impl ObjectId {
    /// Creates an identity for the head of the named object.
    #[must_use]
    pub fn head(name: impl Into<String>) -> Self {
        Self { name: name.into(), snap: SnapId::HEAD }
    }

    /// Creates an identity for a snapshot of the named object.
    #[must_use]
    pub fn at_snap(name: impl Into<String>, snap: SnapId) -> Self {
        Self { name: name.into(), snap }
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eversion_ordering() {
        let a = Eversion::new(1, 10);
        let b = Eversion::new(1, 11);
        let c = Eversion::new(2, 1);

        assert!(a < b);
        assert!(b < c);
        assert!(Eversion::ZERO < a);
    }

    #[test]
    fn test_eversion_zero() {
        assert!(Eversion::ZERO.is_zero());
        assert!(!Eversion::new(0, 1).is_zero());
        assert_eq!(Eversion::default(), Eversion::ZERO);
    }

    #[test]
    fn test_eversion_display() {
        assert_eq!(format!("{}", Eversion::new(3, 17)), "3'17");
    }

    #[test]
    fn test_snap_id_head() {
        assert!(SnapId::HEAD.is_head());
        assert!(!SnapId(0).is_head());
        assert!(SnapId(5) < SnapId::HEAD);
    }

    #[test]
    fn test_object_id_display() {
        let head = ObjectId::head("block.0");
        assert_eq!(format!("{head}"), "block.0@head");

        let snapped = ObjectId::at_snap("block.0", SnapId(4));
        assert_eq!(format!("{snapped}"), "block.0@4");
    }
}
