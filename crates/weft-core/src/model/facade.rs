//! Typed editing API over a causal tree of [`AuxOp`] atoms.
//!
//! [`AuxCausalTree`] builds atoms with the right causes and priorities and
//! groups multi-atom edits into one batch, so each edit produces one
//! `AtomsAdded` notification and one garbage-collection pass.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atom::{Atom, AtomId, SiteInfo};
use crate::config::TreeOptions;
use crate::error::TreeError;
use crate::model::op::AuxOp;
use crate::model::reducer::AuxReducer;
use crate::model::sequence::{
    SequenceRef, SequenceSpan, calculate_sequence_ref, calculate_sequence_refs, stringify,
};
use crate::model::state::{AuxState, EntityState, SequenceMeta};
use crate::tree::{CausalTree, StoredCausalTree};

/// Priority of value and delete atoms: placed before structural siblings.
pub const EDIT_PRIORITY: u32 = 1;

/// An entity to create, with its initial tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntity {
    pub id: String,
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
}

impl NewEntity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, name: impl Into<String>, value: Value) -> Self {
        self.tags.insert(name.into(), value);
        self
    }
}

/// A domain-level change applied by [`AuxCausalTree::add_events`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EntityEvent {
    Add(NewEntity),
    Update {
        id: String,
        tags: BTreeMap<String, Value>,
    },
    Remove {
        id: String,
    },
}

/// Which sequence of a tag an edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Name,
    Value,
}

/// A resolved edit target: the fragment atom plus its character map.
struct Fragment {
    atom: AtomId,
    meta: Option<SequenceMeta>,
    /// Length of the unedited scalar when there is no map yet.
    scalar_len: usize,
}

/// Replica of the entity/tag/value document.
#[derive(Debug)]
pub struct AuxCausalTree {
    tree: CausalTree<AuxOp, AuxReducer>,
}

impl AuxCausalTree {
    #[must_use]
    pub fn new(site: SiteInfo, options: TreeOptions) -> Self {
        Self {
            tree: CausalTree::new(site, AuxReducer, options),
        }
    }

    #[must_use]
    pub fn from_stored(stored: StoredCausalTree<AuxOp>, options: TreeOptions) -> Self {
        Self {
            tree: CausalTree::from_stored(stored, AuxReducer, options),
        }
    }

    /// Decode a stored tree from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::Decode`] for malformed input.
    pub fn from_json(json: &str, options: TreeOptions) -> Result<Self, TreeError> {
        Ok(Self::from_stored(StoredCausalTree::from_json(json)?, options))
    }

    #[must_use]
    pub fn into_inner(self) -> CausalTree<AuxOp, AuxReducer> {
        self.tree
    }

    /// The materialized entities.
    pub fn state(&mut self) -> &AuxState {
        self.tree.value()
    }

    // ------------------------------------------------------------------
    // Atom builders
    // ------------------------------------------------------------------

    pub fn root(&mut self) -> Atom<AuxOp> {
        self.tree.create(AuxOp::Root, None, 0)
    }

    /// Create an entity under the root. `None` when the tree has no root.
    pub fn entity(&mut self, id: impl Into<String>) -> Option<Atom<AuxOp>> {
        let root = self.tree.weave().root()?.id;
        Some(self.tree.create(AuxOp::Entity { id: id.into() }, Some(root), 0))
    }

    pub fn tag(&mut self, name: impl Into<String>, parent: impl Into<AtomId>) -> Atom<AuxOp> {
        self.tree
            .create(AuxOp::Tag { name: name.into() }, Some(parent.into()), 0)
    }

    pub fn value(&mut self, value: Value, parent: impl Into<AtomId>) -> Atom<AuxOp> {
        self.tree
            .create(AuxOp::Value { value }, Some(parent.into()), EDIT_PRIORITY)
    }

    pub fn insert(
        &mut self,
        index: i64,
        text: impl Into<String>,
        parent: impl Into<AtomId>,
    ) -> Atom<AuxOp> {
        let op = AuxOp::Insert {
            index,
            text: text.into(),
        };
        self.tree.create(op, Some(parent.into()), 0)
    }

    pub fn delete(
        &mut self,
        parent: impl Into<AtomId>,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Atom<AuxOp> {
        self.tree
            .create(AuxOp::Delete { start, end }, Some(parent.into()), EDIT_PRIORITY)
    }

    // ------------------------------------------------------------------
    // Text edits
    // ------------------------------------------------------------------

    /// Insert `text` at logical `index` of a tag's value.
    ///
    /// Returns `None` when the entity, tag or value does not exist.
    pub fn insert_into_tag_value(
        &mut self,
        entity: &str,
        tag: &str,
        text: &str,
        index: usize,
    ) -> Option<Atom<AuxOp>> {
        self.insert_into(entity, tag, Target::Value, text, index)
    }

    /// Insert `text` at logical `index` of a tag's name.
    pub fn insert_into_tag_name(
        &mut self,
        entity: &str,
        tag: &str,
        text: &str,
        index: usize,
    ) -> Option<Atom<AuxOp>> {
        self.insert_into(entity, tag, Target::Name, text, index)
    }

    /// Delete `length` characters at logical `index` of a tag's value.
    ///
    /// One delete atom is created per owning atom in the range, all in one
    /// batch. Returns `None` when the entity, tag or value does not exist.
    pub fn delete_from_tag_value(
        &mut self,
        entity: &str,
        tag: &str,
        index: usize,
        length: usize,
    ) -> Option<Vec<Atom<AuxOp>>> {
        self.delete_from(entity, tag, Target::Value, index, length)
    }

    /// Delete `length` characters at logical `index` of a tag's name.
    pub fn delete_from_tag_name(
        &mut self,
        entity: &str,
        tag: &str,
        index: usize,
        length: usize,
    ) -> Option<Vec<Atom<AuxOp>>> {
        self.delete_from(entity, tag, Target::Name, index, length)
    }

    /// Delete a tag's current value outright. The tag stays, without a
    /// value, until a newer value is set.
    ///
    /// Returns `None` when the entity, tag or value does not exist.
    pub fn clear_tag_value(&mut self, entity: &str, tag: &str) -> Option<Atom<AuxOp>> {
        let value = self.fragment(entity, tag, Target::Value)?.atom;
        Some(self.delete(value, None, None))
    }

    /// Delete the atom defining `tag`. An older tag atom resolving to the
    /// same name, if any, takes its place.
    pub fn remove_tag(&mut self, entity: &str, tag: &str) -> Option<Atom<AuxOp>> {
        let tag = self.fragment(entity, tag, Target::Name)?.atom;
        Some(self.delete(tag, None, None))
    }

    fn fragment(&mut self, entity: &str, tag: &str, target: Target) -> Option<Fragment> {
        let entity = self.state().get(entity)?;
        let tag_meta = entity.metadata.tags.get(tag)?;
        match target {
            Target::Name => Some(Fragment {
                atom: tag_meta.atom,
                meta: Some(tag_meta.name.clone()),
                scalar_len: 0,
            }),
            Target::Value => {
                let value = tag_meta.value.as_ref()?;
                let scalar_len = entity
                    .tags
                    .get(tag)
                    .map_or(0, |current| stringify(current).chars().count());
                Some(Fragment {
                    atom: value.atom,
                    meta: value.sequence.clone(),
                    scalar_len,
                })
            }
        }
    }

    fn insert_into(
        &mut self,
        entity: &str,
        tag: &str,
        target: Target,
        text: &str,
        index: usize,
    ) -> Option<Atom<AuxOp>> {
        let fragment = self.fragment(entity, tag, target)?;
        let anchor = match &fragment.meta {
            Some(meta) => calculate_sequence_ref(meta, index).unwrap_or(SequenceRef {
                atom: fragment.atom,
                index: 0,
            }),
            None => SequenceRef {
                atom: fragment.atom,
                index: index.min(fragment.scalar_len),
            },
        };
        Some(self.insert(to_offset(anchor.index), text, anchor.atom))
    }

    fn delete_from(
        &mut self,
        entity: &str,
        tag: &str,
        target: Target,
        index: usize,
        length: usize,
    ) -> Option<Vec<Atom<AuxOp>>> {
        let fragment = self.fragment(entity, tag, target)?;
        let spans = match &fragment.meta {
            Some(meta) => calculate_sequence_refs(meta, index, length),
            None => {
                let start = index.min(fragment.scalar_len);
                let end = index.saturating_add(length).min(fragment.scalar_len);
                if start < end {
                    vec![SequenceSpan {
                        atom: fragment.atom,
                        index: start,
                        length: end - start,
                    }]
                } else {
                    Vec::new()
                }
            }
        };

        Some(self.batched(|aux| {
            spans
                .iter()
                .map(|span| {
                    aux.delete(
                        span.atom,
                        Some(to_offset(span.index)),
                        Some(to_offset(span.index + span.length)),
                    )
                })
                .collect()
        }))
    }

    // ------------------------------------------------------------------
    // Entity-level edits
    // ------------------------------------------------------------------

    /// Create an entity with its initial tags in one batch.
    ///
    /// Tags whose value is `null` or `""` are skipped. Returns `None` when
    /// the tree has no root yet.
    pub fn add_entity(&mut self, entity: NewEntity) -> Option<Vec<Atom<AuxOp>>> {
        if self.tree.weave().root().is_none() {
            return None;
        }
        Some(self.batched(|aux| aux.add_entity_atoms(entity)))
    }

    /// Apply the tag changes in `tags` on top of `current`.
    ///
    /// Only tags whose value differs produce atoms.
    pub fn update_entity(
        &mut self,
        current: &EntityState,
        tags: BTreeMap<String, Value>,
    ) -> Vec<Atom<AuxOp>> {
        self.batched(|aux| aux.update_entity_atoms(current, tags))
    }

    /// Tombstone every live atom defining `current`'s id.
    pub fn remove_entity(&mut self, current: &EntityState) -> Vec<Atom<AuxOp>> {
        self.batched(|aux| aux.remove_entity_atoms(&current.id))
    }

    /// Apply a sequence of domain events as a single batch.
    ///
    /// Updates and removals of unknown entities are skipped.
    pub fn add_events(&mut self, events: Vec<EntityEvent>) -> Vec<Atom<AuxOp>> {
        let count = events.len();
        let atoms = self.batched(|aux| {
            let mut atoms = Vec::new();
            for event in events {
                match event {
                    EntityEvent::Add(entity) => {
                        if aux.tree.weave().root().is_some() {
                            atoms.extend(aux.add_entity_atoms(entity));
                        }
                    }
                    EntityEvent::Update { id, tags } => {
                        if let Some(current) = aux.state().get(&id).cloned() {
                            atoms.extend(aux.update_entity_atoms(&current, tags));
                        }
                    }
                    EntityEvent::Remove { id } => {
                        atoms.extend(aux.remove_entity_atoms(&id));
                    }
                }
            }
            atoms
        });
        tracing::debug!(events = count, atoms = atoms.len(), "applied entity events");
        atoms
    }

    fn add_entity_atoms(&mut self, entity: NewEntity) -> Vec<Atom<AuxOp>> {
        let mut atoms = Vec::new();
        let Some(created) = self.entity(entity.id) else {
            return atoms;
        };
        let entity_id = created.id;
        atoms.push(created);

        for (name, value) in entity.tags {
            if is_blank(&value) {
                continue;
            }
            let tag = self.tag(name, entity_id);
            let value = self.value(value, &tag);
            atoms.push(tag);
            atoms.push(value);
        }
        atoms
    }

    fn update_entity_atoms(
        &mut self,
        current: &EntityState,
        tags: BTreeMap<String, Value>,
    ) -> Vec<Atom<AuxOp>> {
        let mut atoms = Vec::new();
        for (name, value) in tags {
            match current.tags.get(&name) {
                Some(existing) if *existing == value => continue,
                None if is_blank(&value) => continue,
                _ => {}
            }

            if let Some(meta) = current.metadata.tags.get(&name) {
                atoms.push(self.value(value, meta.atom));
            } else {
                let tag = self.tag(name, current.metadata.atom);
                let value = self.value(value, &tag);
                atoms.push(tag);
                atoms.push(value);
            }
        }
        atoms
    }

    fn remove_entity_atoms(&mut self, id: &str) -> Vec<Atom<AuxOp>> {
        let weave = self.tree.weave();
        let live: Vec<AtomId> = weave
            .atoms()
            .iter()
            .filter(|atom| matches!(&atom.value, AuxOp::Entity { id: entity } if entity == id))
            .filter(|atom| {
                !weave
                    .children(&atom.id)
                    .iter()
                    .any(|child| matches!(child.value, AuxOp::Delete { .. }))
            })
            .map(|atom| atom.id)
            .collect();

        live.into_iter()
            .map(|entity| self.delete(entity, None, None))
            .collect()
    }

    fn batched<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.tree.begin_batch();
        let out = f(self);
        self.tree.end_batch();
        out
    }
}

impl Deref for AuxCausalTree {
    type Target = CausalTree<AuxOp, AuxReducer>;

    fn deref(&self) -> &Self::Target {
        &self.tree
    }
}

impl DerefMut for AuxCausalTree {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tree
    }
}

fn is_blank(value: &Value) -> bool {
    matches!(value, Value::Null) || value.as_str().is_some_and(str::is_empty)
}

fn to_offset(index: usize) -> i64 {
    i64::try_from(index).unwrap_or(i64::MAX)
}
