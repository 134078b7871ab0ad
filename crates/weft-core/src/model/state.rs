//! Materialized entity state produced by the domain reducer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atom::AtomId;

/// All live entities keyed by their logical id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxState {
    pub entities: BTreeMap<String, EntityState>,
}

impl AuxState {
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&EntityState> {
        self.entities.get(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// One entity with its visible tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: String,
    /// Tags with a present, non-empty value.
    pub tags: BTreeMap<String, Value>,
    pub metadata: EntityMetadata,
}

impl EntityState {
    #[must_use]
    pub fn tag(&self, name: &str) -> Option<&Value> {
        self.tags.get(name)
    }
}

/// Where each part of an entity came from in the weave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    /// The winning entity atom.
    pub atom: AtomId,
    /// Every live tag slot, including ones whose value is omitted from `tags`.
    pub tags: BTreeMap<String, TagMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMetadata {
    /// The winning tag atom.
    pub atom: AtomId,
    /// Character map of the resolved tag name.
    pub name: SequenceMeta,
    /// The winning value, if the tag has one.
    pub value: Option<ValueMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMetadata {
    pub atom: AtomId,
    /// `None` for a non-string value that was never edited.
    pub sequence: Option<SequenceMeta>,
}

/// Per-character provenance of a reconstructed string.
///
/// `refs[i]` owns character `i` and `indexes[i]` is its offset inside that
/// atom's own text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceMeta {
    pub indexes: Vec<usize>,
    pub refs: Vec<AtomId>,
}

impl SequenceMeta {
    /// Trivial 1:1 map of `len` characters onto `atom`.
    #[must_use]
    pub fn identity(atom: AtomId, len: usize) -> Self {
        Self {
            indexes: (0..len).collect(),
            refs: vec![atom; len],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}
