use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use weft_core::{
    Atom, AuxCausalTree, AuxOp, AuxState, EntityEvent, NewEntity, SiteInfo, TreeEvent,
    TreeOptions, WeaveVersion,
};

use crate::rng::DeterministicRng;

/// Index of a replica in the simulation; its site id is `index + 1`.
pub type ReplicaId = usize;

const ENTITIES: [&str; 4] = ["alpha", "beta", "gamma", "delta"];
const TAGS: [&str; 3] = ["title", "body", "owner"];
const WORDS: [&str; 6] = ["the ", "quick", " fox", "é", "\n", "42"];

/// A façade edit chosen by the scripted workload.
///
/// Choices depend only on the RNG, never on replica state, so the same seed
/// drives identical workloads through replicas with and without GC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptedEdit {
    AddEntity { entity: String, tag: String, value: Value },
    SetValue { entity: String, tag: String, value: Value },
    InsertText { entity: String, tag: String, index: usize, text: String },
    DeleteText { entity: String, tag: String, index: usize, length: usize },
    RenameTag { entity: String, tag: String, index: usize, text: String },
    Remove { entity: String },
    /// Delete the tag's current value atom outright.
    ClearValue { entity: String, tag: String },
    /// Delete the tag atom outright.
    RemoveTag { entity: String, tag: String },
    /// Type `count` characters at the end of the value, one insert each.
    AppendRun { entity: String, tag: String, count: usize },
}

impl ScriptedEdit {
    /// Draw a random edit.
    pub fn generate(rng: &mut DeterministicRng) -> Self {
        let entity = ENTITIES[rng.index(ENTITIES.len())].to_string();
        let tag = TAGS[rng.index(TAGS.len())].to_string();
        match rng.below(24) {
            0..=2 => Self::AddEntity {
                entity,
                tag,
                value: sample_value(rng),
            },
            3..=6 => Self::SetValue {
                entity,
                tag,
                value: sample_value(rng),
            },
            7..=12 => Self::InsertText {
                entity,
                tag,
                index: rng.index(24),
                text: WORDS[rng.index(WORDS.len())].to_string(),
            },
            13..=16 => Self::DeleteText {
                entity,
                tag,
                index: rng.index(24),
                length: 1 + rng.index(5),
            },
            17..=18 => Self::RenameTag {
                entity,
                tag,
                index: rng.index(8),
                text: WORDS[rng.index(WORDS.len())].to_string(),
            },
            19 => Self::Remove { entity },
            20..=21 => Self::ClearValue { entity, tag },
            22 => Self::RemoveTag { entity, tag },
            _ => Self::AppendRun {
                entity,
                tag,
                count: 8 + rng.index(57),
            },
        }
    }
}

fn sample_value(rng: &mut DeterministicRng) -> Value {
    match rng.below(6) {
        0 => json!("hello"),
        1 => json!("shared notes"),
        2 => json!(rng.below(1_000)),
        3 => json!(true),
        4 => Value::Null,
        _ => json!(""),
    }
}

/// Length in characters of a tag's value as the façade indexes it.
fn value_len(state: &AuxState, entity: &str, tag: &str) -> usize {
    match state.get(entity).and_then(|entity| entity.tag(tag)) {
        Some(Value::String(text)) => text.chars().count(),
        Some(other) => other.to_string().chars().count(),
        None => 0,
    }
}

/// Observable end state of a replica, compared by the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub id: ReplicaId,
    pub time: u64,
    pub version: WeaveVersion,
    pub atoms: Vec<Atom<AuxOp>>,
    pub pending: usize,
    /// `None` when the weave passes its structural check.
    pub invalid: Option<String>,
    pub state: AuxState,
}

/// One simulated site: a façade replica plus the atoms it authored and has
/// not yet handed to the network.
#[derive(Debug)]
pub struct SimulatedReplica {
    id: ReplicaId,
    tree: AuxCausalTree,
    events: Receiver<TreeEvent<AuxOp>>,
    authored: Vec<Atom<AuxOp>>,
    unsent: usize,
}

impl SimulatedReplica {
    #[must_use]
    pub fn new(id: ReplicaId, options: TreeOptions) -> Self {
        let site = u32::try_from(id + 1).unwrap_or(u32::MAX);
        let mut tree = AuxCausalTree::new(SiteInfo::new(site), options);
        let events = tree.subscribe();
        Self {
            id,
            tree,
            events,
            authored: Vec::new(),
            unsent: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ReplicaId {
        self.id
    }

    #[must_use]
    pub const fn tree(&self) -> &AuxCausalTree {
        &self.tree
    }

    /// Every atom this replica has created so far.
    #[must_use]
    pub fn authored(&self) -> &[Atom<AuxOp>] {
        &self.authored
    }

    /// Create the document root. Only one replica should do this.
    pub fn create_root(&mut self) -> usize {
        self.tree.root();
        self.collect_authored()
    }

    /// Apply a scripted edit; returns how many atoms it created.
    pub fn apply(&mut self, edit: &ScriptedEdit) -> usize {
        let tree = &mut self.tree;
        match edit {
            ScriptedEdit::AddEntity { entity, tag, value } => {
                tree.add_entity(NewEntity::new(entity.as_str()).with_tag(tag.as_str(), value.clone()));
            }
            ScriptedEdit::SetValue { entity, tag, value } => {
                let mut tags = BTreeMap::new();
                tags.insert(tag.clone(), value.clone());
                tree.add_events(vec![EntityEvent::Update {
                    id: entity.clone(),
                    tags,
                }]);
            }
            ScriptedEdit::InsertText {
                entity,
                tag,
                index,
                text,
            } => {
                tree.insert_into_tag_value(entity, tag, text, *index);
            }
            ScriptedEdit::DeleteText {
                entity,
                tag,
                index,
                length,
            } => {
                tree.delete_from_tag_value(entity, tag, *index, *length);
            }
            ScriptedEdit::RenameTag {
                entity,
                tag,
                index,
                text,
            } => {
                tree.insert_into_tag_name(entity, tag, text, *index);
            }
            ScriptedEdit::Remove { entity } => {
                tree.add_events(vec![EntityEvent::Remove { id: entity.clone() }]);
            }
            ScriptedEdit::ClearValue { entity, tag } => {
                tree.clear_tag_value(entity, tag);
            }
            ScriptedEdit::RemoveTag { entity, tag } => {
                tree.remove_tag(entity, tag);
            }
            ScriptedEdit::AppendRun { entity, tag, count } => {
                for _ in 0..*count {
                    let end = value_len(tree.state(), entity, tag);
                    tree.insert_into_tag_value(entity, tag, "~", end);
                }
            }
        }
        self.collect_authored()
    }

    /// Import a delivered batch; returns the number of atoms placed.
    pub fn receive(&mut self, atoms: Vec<Atom<AuxOp>>) -> usize {
        let added = self.tree.import(atoms).len();
        // Drain the import notification too.
        self.collect_authored();
        added
    }

    /// Own atoms created since the last call.
    pub fn take_unsent(&mut self) -> Vec<Atom<AuxOp>> {
        let fresh = self.authored[self.unsent..].to_vec();
        self.unsent = self.authored.len();
        fresh
    }

    #[must_use]
    pub fn snapshot(&mut self) -> ReplicaSnapshot {
        let state = self.tree.state().clone();
        ReplicaSnapshot {
            id: self.id,
            time: self.tree.time(),
            version: self.tree.version(),
            atoms: self.tree.weave().atoms().to_vec(),
            pending: self.tree.weave().pending_len(),
            invalid: self.tree.validate().err().map(|e| e.to_string()),
            state,
        }
    }

    fn collect_authored(&mut self) -> usize {
        let site = self.tree.site().id;
        let before = self.authored.len();
        for event in self.events.try_iter() {
            if let TreeEvent::AtomsAdded(atoms) = event {
                self.authored
                    .extend(atoms.into_iter().filter(|atom| atom.id.site == site));
            }
        }
        self.authored.len() - before
    }
}
