//! The weave: a deterministic linearization of the causal tree.
//!
//! The [`Weave`] stores atoms in a flat arena in weave order, with an
//! id → position index for lookups. Causes are ids resolved through the
//! index, never references, so removing atoms is plain arena compaction.
//!
//! # Shape
//!
//! The weave is a depth-first pre-order walk of the causal tree:
//!
//! - the root sits at position 0;
//! - every atom is followed immediately by its whole subtree (its *block*);
//! - children of the same cause appear in [`AtomId::weave_cmp`] order, so
//!   the final order depends only on which atoms are present, never on the
//!   order they arrived in.
//!
//! # Orphans
//!
//! An atom whose cause has not arrived yet is buffered and inserted as soon
//! as the cause shows up. Atoms whose cause was archived by garbage
//! collection are dropped: they can never become visible again.
//!
//! # Memory
//!
//! Buffered orphans and the ids of archived atoms are kept until the owner
//! lets go of them. A replica that keeps receiving atoms for causes it will
//! never see, or that collects garbage for a long time, grows both sets
//! without bound. [`Weave::pending_len`] and [`Weave::archived_len`] expose
//! their size; [`Weave::drain_pending`] and [`Weave::forget_archived`]
//! release them.
//!
//! # Cost
//!
//! Placing one atom shifts the arena and reindexes everything after it.
//! [`Weave::import`] places large batches in one pass instead, sorting the
//! whole tree once.

mod version;

pub use version::WeaveVersion;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::atom::{Atom, AtomId};

/// Batches at least this large are placed by rebuilding the arena once
/// instead of inserting atom by atom.
const BULK_IMPORT: usize = 64;

/// Structural problems detected by [`Weave::check`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WeaveError {
    #[error("weave has no root atom")]
    NoRoot,

    #[error("atom {atom} appears more than once")]
    DuplicateAtom { atom: AtomId },

    #[error("weave has more than one root: {first} and {second}")]
    MultipleRoots { first: AtomId, second: AtomId },

    #[error("atom {atom} references missing cause {cause}")]
    MissingCause { atom: AtomId, cause: AtomId },

    #[error("atom {atom} appears before its cause {cause}")]
    CauseAfterAtom { atom: AtomId, cause: AtomId },

    #[error("atom {atom} is separated from the block of its cause {cause}")]
    DetachedFromCause { atom: AtomId, cause: AtomId },

    #[error("children of {cause} are out of order: {first} is placed before {second}")]
    SiblingOrder {
        cause: AtomId,
        first: AtomId,
        second: AtomId,
    },
}

/// Ordered, append-only log of atoms forming a causal tree.
#[derive(Debug, Clone)]
pub struct Weave<O> {
    atoms: Vec<Atom<O>>,
    /// Depth in the causal tree of the atom at the same position.
    depths: Vec<usize>,
    positions: HashMap<AtomId, usize>,
    /// Orphans keyed by the id of the cause they are waiting for.
    pending: HashMap<AtomId, Vec<Atom<O>>>,
    pending_ids: HashSet<AtomId>,
    archived: HashSet<AtomId>,
    buffer_orphans: bool,
}

impl<O> Default for Weave<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Weave<O> {
    /// Create an empty weave that buffers orphans.
    #[must_use]
    pub fn new() -> Self {
        Self {
            atoms: Vec::new(),
            depths: Vec::new(),
            positions: HashMap::new(),
            pending: HashMap::new(),
            pending_ids: HashSet::new(),
            archived: HashSet::new(),
            buffer_orphans: true,
        }
    }

    /// Choose whether atoms with a missing cause are buffered (default) or
    /// dropped.
    pub fn set_buffer_orphans(&mut self, buffer: bool) {
        self.buffer_orphans = buffer;
    }

    /// All atoms in weave order.
    #[must_use]
    pub fn atoms(&self) -> &[Atom<O>] {
        &self.atoms
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// The root atom, if the weave has one.
    #[must_use]
    pub fn root(&self) -> Option<&Atom<O>> {
        self.atoms.first().filter(|atom| atom.is_root())
    }

    #[must_use]
    pub fn get(&self, id: &AtomId) -> Option<&Atom<O>> {
        self.positions.get(id).map(|&pos| &self.atoms[pos])
    }

    /// Position of an atom in weave order.
    #[must_use]
    pub fn position(&self, id: &AtomId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    #[must_use]
    pub fn contains(&self, id: &AtomId) -> bool {
        self.positions.contains_key(id)
    }

    /// Number of orphans waiting for their cause.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending_ids.len()
    }

    /// Number of ids remembered as removed by garbage collection.
    #[must_use]
    pub fn archived_len(&self) -> usize {
        self.archived.len()
    }

    /// Give up on every buffered orphan and return them.
    ///
    /// A drained atom is forgotten entirely: if it is delivered again after
    /// its cause arrives, it is placed normally.
    pub fn drain_pending(&mut self) -> Vec<Atom<O>> {
        self.pending_ids.clear();
        let mut drained: Vec<Atom<O>> = self.pending.drain().flat_map(|(_, atoms)| atoms).collect();
        drained.sort_by_key(|atom| (atom.id.site, atom.id.timestamp));
        drained
    }

    /// Forget which atoms garbage collection removed. Returns how many ids
    /// were dropped.
    ///
    /// Only safe once no peer will deliver those atoms, or atoms caused by
    /// them, again: after this a re-delivered copy is placed like any new
    /// atom.
    pub fn forget_archived(&mut self) -> usize {
        let forgotten = self.archived.len();
        self.archived = HashSet::new();
        forgotten
    }

    /// Whether `id` was ever delivered: present, buffered, or archived.
    #[must_use]
    pub fn has_seen(&self, id: &AtomId) -> bool {
        self.positions.contains_key(id)
            || self.pending_ids.contains(id)
            || self.archived.contains(id)
    }

    /// Whether an atom was removed by garbage collection.
    #[must_use]
    pub fn is_archived(&self, id: &AtomId) -> bool {
        self.archived.contains(id)
    }

    /// Direct children of `id`, in sibling order.
    #[must_use]
    pub fn children(&self, id: &AtomId) -> Vec<&Atom<O>> {
        let Some(&pos) = self.positions.get(id) else {
            return Vec::new();
        };

        let mut children = Vec::new();
        let mut next = pos + 1;
        while next < self.atoms.len() && self.atoms[next].cause.as_ref() == Some(id) {
            children.push(&self.atoms[next]);
            next = self.block_end(next);
        }
        children
    }

    /// The contiguous block made of `id` and all of its descendants.
    #[must_use]
    pub fn subtree(&self, id: &AtomId) -> &[Atom<O>] {
        match self.positions.get(id) {
            Some(&pos) => &self.atoms[pos..self.block_end(pos)],
            None => &[],
        }
    }

    /// Returns `true` when [`check`](Self::check) finds no violation.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    /// Re-verify the structural invariants of the weave.
    ///
    /// # Errors
    ///
    /// Returns the first [`WeaveError`] found while walking the weave.
    pub fn check(&self) -> Result<(), WeaveError> {
        Self::check_order(&self.atoms)
    }

    /// Check a sequence of atoms exactly as laid out, for instance the weave
    /// of a stored tree before it is loaded. Loading re-places every atom,
    /// so mistakes in the stored order only show up here.
    ///
    /// # Errors
    ///
    /// Returns the first [`WeaveError`] found while walking `atoms`.
    pub fn check_order(atoms: &[Atom<O>]) -> Result<(), WeaveError> {
        let Some(first) = atoms.first() else {
            return Err(WeaveError::NoRoot);
        };
        if !first.is_root() {
            return Err(WeaveError::NoRoot);
        }

        let mut seen: HashSet<AtomId> = HashSet::with_capacity(atoms.len());
        // Ancestor chain of the current atom, each with its last seen child.
        let mut stack: Vec<(AtomId, Option<AtomId>)> = Vec::new();

        for (index, atom) in atoms.iter().enumerate() {
            if !seen.insert(atom.id) {
                return Err(WeaveError::DuplicateAtom { atom: atom.id });
            }
            let Some(cause) = atom.cause else {
                if index != 0 {
                    return Err(WeaveError::MultipleRoots {
                        first: first.id,
                        second: atom.id,
                    });
                }
                stack.push((atom.id, None));
                continue;
            };

            while stack.last().is_some_and(|(top, _)| *top != cause) {
                stack.pop();
            }

            let Some((_, last_child)) = stack.last_mut() else {
                return Err(match atoms.iter().position(|other| other.id == cause) {
                    None => WeaveError::MissingCause {
                        atom: atom.id,
                        cause,
                    },
                    Some(pos) if pos > index => WeaveError::CauseAfterAtom {
                        atom: atom.id,
                        cause,
                    },
                    Some(_) => WeaveError::DetachedFromCause {
                        atom: atom.id,
                        cause,
                    },
                });
            };

            if let Some(previous) = *last_child {
                if previous.weave_cmp(&atom.id) != Ordering::Less {
                    return Err(WeaveError::SiblingOrder {
                        cause,
                        first: previous,
                        second: atom.id,
                    });
                }
            }
            *last_child = Some(atom.id);
            stack.push((atom.id, None));
        }

        Ok(())
    }

    /// Summarize the weave as a per-site version vector plus content hash.
    #[must_use]
    pub fn version(&self) -> WeaveVersion {
        WeaveVersion::of(&self.atoms)
    }

    /// Exclusive end of the block that starts at `pos`: the first later
    /// atom that is not deeper than the one at `pos`.
    fn block_end(&self, pos: usize) -> usize {
        let depth = self.depths[pos];
        self.depths[pos + 1..]
            .iter()
            .position(|&d| d <= depth)
            .map_or(self.depths.len(), |offset| pos + 1 + offset)
    }

    fn depth_under(&self, cause: Option<AtomId>) -> usize {
        cause
            .and_then(|cause| self.positions.get(&cause))
            .map_or(0, |&pos| self.depths[pos] + 1)
    }

    /// Position at which `atom` belongs among its siblings.
    fn insertion_point(&self, atom: &Atom<O>) -> usize {
        let mut next = match atom.cause {
            Some(cause) => self.positions[&cause] + 1,
            None => 0,
        };

        while next < self.atoms.len() && self.atoms[next].cause == atom.cause {
            if atom.id.weave_cmp(&self.atoms[next].id) == Ordering::Less {
                break;
            }
            next = self.block_end(next);
        }
        next
    }

    /// Forget a buffered orphan and, transitively, everything waiting on
    /// it, remembering them all as archived.
    fn archive_with_pending(&mut self, id: AtomId) {
        self.archived.insert(id);
        self.discard_pending(&id);
    }

    /// Recompute depths and positions for the whole arena.
    fn reindex_all(&mut self) {
        self.positions.clear();
        self.depths.clear();
        for pos in 0..self.atoms.len() {
            let depth = self.depth_under(self.atoms[pos].cause);
            self.depths.push(depth);
            self.positions.insert(self.atoms[pos].id, pos);
        }
    }

    fn reindex_from(&mut self, start: usize) {
        for (offset, atom) in self.atoms[start..].iter().enumerate() {
            self.positions.insert(atom.id, start + offset);
        }
    }

    fn discard_pending(&mut self, cause: &AtomId) {
        let mut queue = VecDeque::from([*cause]);
        while let Some(id) = queue.pop_front() {
            if let Some(orphans) = self.pending.remove(&id) {
                for orphan in orphans {
                    self.pending_ids.remove(&orphan.id);
                    self.archived.insert(orphan.id);
                    queue.push_back(orphan.id);
                }
            }
        }
    }
}

impl<O: Clone> Weave<O> {
    /// Insert one atom at its deterministic position.
    ///
    /// Returns every atom that entered the weave, in causal order: the atom
    /// itself followed by any buffered descendants it released. Duplicates,
    /// archived atoms and newly buffered orphans yield an empty vector.
    pub fn insert(&mut self, atom: Atom<O>) -> Vec<Atom<O>> {
        if self.positions.contains_key(&atom.id)
            || self.pending_ids.contains(&atom.id)
            || self.archived.contains(&atom.id)
        {
            return Vec::new();
        }

        match atom.cause {
            Some(cause) if self.archived.contains(&cause) => {
                tracing::trace!(atom = %atom.id, %cause, "dropping atom caused by archived atom");
                self.archive_with_pending(atom.id);
                return Vec::new();
            }
            Some(cause) if !self.positions.contains_key(&cause) => {
                if self.buffer_orphans {
                    tracing::debug!(atom = %atom.id, %cause, "buffering atom until its cause arrives");
                    self.pending_ids.insert(atom.id);
                    self.pending.entry(cause).or_default().push(atom);
                } else {
                    tracing::debug!(atom = %atom.id, %cause, "dropping atom with missing cause");
                }
                return Vec::new();
            }
            None if self.root().is_some() => {
                tracing::warn!(atom = %atom.id, "second root atom inserted; weave is no longer valid");
            }
            _ => {}
        }

        let mut added = Vec::new();
        let mut queue = VecDeque::from([atom]);
        while let Some(next) = queue.pop_front() {
            let id = next.id;
            let pos = self.insertion_point(&next);
            tracing::trace!(atom = %id, pos, "placing atom");
            let depth = self.depth_under(next.cause);
            added.push(next.clone());
            self.atoms.insert(pos, next);
            self.depths.insert(pos, depth);
            self.reindex_from(pos);

            if let Some(released) = self.pending.remove(&id) {
                for orphan in released {
                    self.pending_ids.remove(&orphan.id);
                    queue.push_back(orphan);
                }
            }
        }
        added
    }

    /// Insert every atom not already present.
    ///
    /// Returns the newly added atoms in causal order: every atom comes after
    /// its cause. Large batches are placed in one pass; the resulting weave
    /// is the same as inserting them one at a time.
    pub fn import<I>(&mut self, atoms: I) -> Vec<Atom<O>>
    where
        I: IntoIterator<Item = Atom<O>>,
    {
        let batch: Vec<Atom<O>> = atoms.into_iter().collect();
        // Without buffering, placement depends on arrival order within the
        // batch, so only the one-by-one path reproduces it.
        if batch.len() < BULK_IMPORT || !self.buffer_orphans {
            return batch.into_iter().flat_map(|atom| self.insert(atom)).collect();
        }
        self.bulk_import(batch)
    }

    fn bulk_import(&mut self, batch: Vec<Atom<O>>) -> Vec<Atom<O>> {
        let mut roots: Vec<Atom<O>> = Vec::new();
        for atom in batch {
            if self.has_seen(&atom.id) || roots.iter().any(|root| root.id == atom.id) {
                continue;
            }
            match atom.cause {
                Some(cause) if self.archived.contains(&cause) => {
                    tracing::trace!(atom = %atom.id, %cause, "dropping atom caused by archived atom");
                    self.archive_with_pending(atom.id);
                }
                Some(cause) => {
                    self.pending_ids.insert(atom.id);
                    self.pending.entry(cause).or_default().push(atom);
                }
                None => {
                    if self.root().is_some() || !roots.is_empty() {
                        tracing::warn!(atom = %atom.id, "second root atom imported; weave is no longer valid");
                    }
                    roots.push(atom);
                }
            }
        }

        // Release everything now reachable from a placed atom.
        let mut queue: VecDeque<AtomId> = self
            .pending
            .keys()
            .filter(|cause| self.positions.contains_key(cause))
            .copied()
            .collect();
        queue.extend(roots.iter().map(|root| root.id));
        let mut released = roots;
        while let Some(id) = queue.pop_front() {
            for orphan in self.pending.remove(&id).unwrap_or_default() {
                self.pending_ids.remove(&orphan.id);
                queue.push_back(orphan.id);
                released.push(orphan);
            }
        }
        if released.is_empty() {
            return Vec::new();
        }

        let fresh: HashSet<AtomId> = released.iter().map(|atom| atom.id).collect();
        let mut everything = std::mem::take(&mut self.atoms);
        everything.extend(released);
        self.atoms = weave_order(everything);
        self.reindex_all();
        tracing::debug!(added = fresh.len(), atoms = self.atoms.len(), "placed imported batch");

        self.atoms
            .iter()
            .filter(|atom| fresh.contains(&atom.id))
            .cloned()
            .collect()
    }

    /// Remove each listed atom together with its whole block.
    ///
    /// Removed ids are remembered so re-delivered copies (and atoms caused by
    /// them) are ignored. Returns the removed atoms in removal order.
    pub fn remove_subtrees(&mut self, ids: &[AtomId]) -> Vec<Atom<O>> {
        let mut removed = Vec::new();
        for id in ids {
            let Some(&pos) = self.positions.get(id) else {
                continue;
            };
            let end = self.block_end(pos);
            self.depths.drain(pos..end);
            let block: Vec<Atom<O>> = self.atoms.drain(pos..end).collect();
            for atom in &block {
                self.positions.remove(&atom.id);
                self.archived.insert(atom.id);
            }
            for atom in &block {
                self.discard_pending(&atom.id);
            }
            self.reindex_from(pos);
            removed.extend(block);
        }
        removed
    }
}

/// Lay `atoms` out as a depth-first pre-order walk with siblings in
/// [`AtomId::weave_cmp`] order. Atoms not reachable from a root keep their
/// relative order at the end.
fn weave_order<O>(atoms: Vec<Atom<O>>) -> Vec<Atom<O>> {
    let mut children: HashMap<Option<AtomId>, Vec<usize>> = HashMap::new();
    for (index, atom) in atoms.iter().enumerate() {
        children.entry(atom.cause).or_default().push(index);
    }
    for siblings in children.values_mut() {
        siblings.sort_by(|&a, &b| atoms[a].id.weave_cmp(&atoms[b].id));
    }

    let mut ordered = Vec::with_capacity(atoms.len());
    let mut stack: Vec<usize> = children
        .get(&None)
        .map(|roots| roots.iter().rev().copied().collect())
        .unwrap_or_default();
    while let Some(index) = stack.pop() {
        ordered.push(index);
        if let Some(kids) = children.get(&Some(atoms[index].id)) {
            stack.extend(kids.iter().rev().copied());
        }
    }

    let mut slots: Vec<Option<Atom<O>>> = atoms.into_iter().map(Some).collect();
    let mut woven: Vec<Atom<O>> = ordered
        .into_iter()
        .filter_map(|index| slots[index].take())
        .collect();
    woven.extend(slots.into_iter().flatten());
    woven
}
