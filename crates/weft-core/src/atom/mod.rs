//! Atom identity for the causal tree.
//!
//! Every mutation in a causal tree is an [`Atom`]: an immutable operation
//! stamped with a globally unique [`AtomId`] and pointing at the atom it was
//! caused by. Ids double as the sort key that places an atom among its
//! siblings in the weave.
//!
//! # Ordering
//!
//! Identity and weave placement use different orders:
//!
//! - **Identity** (`Eq`, `Hash`): `(site, timestamp)`. Priority is a
//!   placement hint, never part of identity.
//! - **Placement** ([`AtomId::weave_cmp`]): `priority` descending, then
//!   `timestamp` descending, then `site` descending. The atom that sorts
//!   first sits closest to its cause, so the newest sibling comes first.

pub mod factory;

pub use factory::AtomFactory;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A replica identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiteInfo {
    /// Numeric site id; the final tie-break when ordering concurrent atoms.
    pub id: u32,
}

impl SiteInfo {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self { id }
    }
}

/// Globally unique, totally ordered identifier of an atom.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AtomId {
    /// Site that created the atom.
    pub site: u32,
    /// Lamport timestamp assigned by the creating site.
    pub timestamp: u64,
    /// Placement priority among siblings; higher sorts first.
    #[serde(default)]
    pub priority: u32,
}

impl AtomId {
    #[must_use]
    pub const fn new(site: u32, timestamp: u64, priority: u32) -> Self {
        Self {
            site,
            timestamp,
            priority,
        }
    }

    /// Compare two ids by weave placement.
    ///
    /// `Ordering::Less` means `self` is placed before `other` when both are
    /// children of the same cause.
    #[must_use]
    pub fn weave_cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.timestamp.cmp(&self.timestamp))
            .then_with(|| other.site.cmp(&self.site))
    }
}

impl PartialEq for AtomId {
    fn eq(&self, other: &Self) -> bool {
        self.site == other.site && self.timestamp == other.timestamp
    }
}

impl Eq for AtomId {}

impl Hash for AtomId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.site.hash(state);
        self.timestamp.hash(state);
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.priority == 0 {
            write!(f, "{}@{}", self.site, self.timestamp)
        } else {
            write!(f, "{}@{}:{}", self.site, self.timestamp, self.priority)
        }
    }
}

/// An immutable operation in the causal tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom<O> {
    pub id: AtomId,
    /// The atom this one was caused by; `None` marks a root.
    pub cause: Option<AtomId>,
    /// The operation payload.
    pub value: O,
}

impl<O> Atom<O> {
    #[must_use]
    pub const fn new(id: AtomId, cause: Option<AtomId>, value: O) -> Self {
        Self { id, cause, value }
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.cause.is_none()
    }
}

impl<O> From<&Atom<O>> for AtomId {
    fn from(atom: &Atom<O>) -> Self {
        atom.id
    }
}
