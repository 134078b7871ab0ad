//! Per-site Lamport clock that stamps new atoms.

use super::{Atom, AtomId};

/// Generates monotonically increasing atom ids for the local site.
///
/// The clock follows the Lamport rule: every locally created atom advances
/// the clock by one, and every observed foreign atom pulls the clock past its
/// timestamp. New local atoms are therefore ordered after everything the
/// site has already seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomFactory {
    site: u32,
    time: u64,
}

impl AtomFactory {
    #[must_use]
    pub const fn new(site: u32, time: u64) -> Self {
        Self { site, time }
    }

    #[must_use]
    pub const fn site(&self) -> u32 {
        self.site
    }

    /// Current logical time (the timestamp of the last stamped atom).
    #[must_use]
    pub const fn time(&self) -> u64 {
        self.time
    }

    /// Stamp a new atom caused by `cause`.
    pub fn create<O>(&mut self, op: O, cause: Option<AtomId>, priority: u32) -> Atom<O> {
        self.time += 1;
        Atom::new(AtomId::new(self.site, self.time, priority), cause, op)
    }

    /// Absorb a timestamp observed on a foreign atom.
    ///
    /// Never call this for atoms created by the local site: re-delivery of
    /// our own atoms must not move the clock.
    pub fn update_time(&mut self, observed: u64) {
        self.time = self.time.max(observed) + 1;
    }
}
