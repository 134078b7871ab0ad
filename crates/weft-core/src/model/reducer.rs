//! Domain reducer: weave → entities → tags → values.
//!
//! Siblings sit newest-first in the weave, so the first live atom met for a
//! logical key is the last write. That gives last-writer-wins for entity
//! ids and tag names without any extra bookkeeping. Values are stricter: the
//! newest value atom decides, and deleting it leaves the tag empty.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::atom::{Atom, AtomId};
use crate::model::gc;
use crate::model::op::AuxOp;
use crate::model::sequence::{ChildIndex, child_index, resolve_text, resolve_value};
use crate::model::state::{AuxState, EntityMetadata, EntityState, TagMetadata, ValueMetadata};
use crate::tree::Reducer;
use crate::weave::Weave;

/// Reduces an [`AuxOp`] weave into [`AuxState`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuxReducer;

impl Reducer<AuxOp> for AuxReducer {
    type Value = AuxState;

    fn eval(&self, weave: &Weave<AuxOp>) -> AuxState {
        let children = child_index(weave);
        let mut state = AuxState::default();

        for atom in weave.atoms() {
            let AuxOp::Entity { id } = &atom.value else {
                continue;
            };
            if state.entities.contains_key(id) || has_delete(&children, atom.id) {
                continue;
            }
            state
                .entities
                .insert(id.clone(), reduce_entity(&children, atom, id));
        }

        tracing::trace!(
            atoms = weave.len(),
            entities = state.entities.len(),
            "reduced weave"
        );
        state
    }

    fn collect_garbage(&self, weave: &Weave<AuxOp>) -> Vec<AtomId> {
        gc::superseded_values(weave)
    }
}

fn reduce_entity(children: &ChildIndex<'_>, atom: &Atom<AuxOp>, id: &str) -> EntityState {
    let mut tags = BTreeMap::new();
    let mut tag_meta: BTreeMap<String, TagMetadata> = BTreeMap::new();

    for tag in children.get(&atom.id).into_iter().flatten() {
        let AuxOp::Tag { name } = &tag.value else {
            continue;
        };
        if has_whole_delete(children, tag.id) {
            continue;
        }

        let (name, name_meta) = resolve_text(children, tag.id, name);
        if name.is_empty() || tag_meta.contains_key(&name) {
            continue;
        }

        let value = winning_value(children, tag.id).map(|(value_atom, value)| {
            let (resolved, sequence) = resolve_value(children, value_atom, value);
            (resolved, ValueMetadata { atom: value_atom, sequence })
        });

        let value_meta = value.map(|(resolved, meta)| {
            if is_present(&resolved) {
                tags.insert(name.clone(), resolved);
            }
            meta
        });

        tag_meta.insert(
            name,
            TagMetadata {
                atom: tag.id,
                name: name_meta,
                value: value_meta,
            },
        );
    }

    EntityState {
        id: id.to_string(),
        tags,
        metadata: EntityMetadata {
            atom: atom.id,
            tags: tag_meta,
        },
    }
}

/// The newest value under `tag`.
///
/// A whole-range delete on it clears the tag. Older values never resurface,
/// which is what lets garbage collection drop them as soon as they are
/// shadowed.
fn winning_value<'a>(children: &ChildIndex<'a>, tag: AtomId) -> Option<(AtomId, &'a Value)> {
    let newest = children
        .get(&tag)?
        .iter()
        .copied()
        .find_map(|atom| match &atom.value {
            AuxOp::Value { value } => Some((atom.id, value)),
            _ => None,
        })?;
    (!has_whole_delete(children, newest.0)).then_some(newest)
}

/// `null` and `""` are treated as "no value".
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.is_empty(),
        _ => true,
    }
}

fn has_delete(children: &ChildIndex<'_>, atom: AtomId) -> bool {
    children
        .get(&atom)
        .is_some_and(|kids| kids.iter().any(|kid| matches!(kid.value, AuxOp::Delete { .. })))
}

pub(crate) fn has_whole_delete(children: &ChildIndex<'_>, atom: AtomId) -> bool {
    children
        .get(&atom)
        .is_some_and(|kids| kids.iter().any(|kid| kid.value.is_whole_delete()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Builder {
        weave: Weave<AuxOp>,
        time: u64,
    }

    impl Builder {
        fn new() -> Self {
            let mut weave = Weave::new();
            weave.insert(Atom::new(AtomId::new(1, 1, 0), None, AuxOp::Root));
            Self { weave, time: 1 }
        }

        fn root(&self) -> AtomId {
            AtomId::new(1, 1, 0)
        }

        fn add_from(&mut self, site: u32, cause: AtomId, op: AuxOp, priority: u32) -> AtomId {
            self.time += 1;
            let id = AtomId::new(site, self.time, priority);
            self.weave.insert(Atom::new(id, Some(cause), op));
            id
        }

        fn entity(&mut self, id: &str) -> AtomId {
            self.add_from(1, self.root(), AuxOp::Entity { id: id.into() }, 0)
        }

        fn tag(&mut self, entity: AtomId, name: &str) -> AtomId {
            self.add_from(1, entity, AuxOp::Tag { name: name.into() }, 0)
        }

        fn value(&mut self, tag: AtomId, value: Value) -> AtomId {
            self.add_from(1, tag, AuxOp::Value { value }, 1)
        }

        fn delete(&mut self, cause: AtomId) -> AtomId {
            self.add_from(
                1,
                cause,
                AuxOp::Delete {
                    start: None,
                    end: None,
                },
                1,
            )
        }

        fn eval(&self) -> AuxState {
            AuxReducer.eval(&self.weave)
        }
    }

    #[test]
    fn empty_weave_reduces_to_empty_state() {
        assert!(AuxReducer.eval(&Weave::new()).is_empty());
        assert!(Builder::new().eval().is_empty());
    }

    #[test]
    fn entity_with_tag_and_value() {
        let mut b = Builder::new();
        let e = b.entity("bot");
        let t = b.tag(e, "color");
        let v = b.value(t, json!("red"));

        let state = b.eval();
        let bot = state.get("bot").expect("entity");
        assert_eq!(bot.tag("color"), Some(&json!("red")));
        assert_eq!(bot.metadata.atom, e);
        let tag = &bot.metadata.tags["color"];
        assert_eq!(tag.atom, t);
        assert_eq!(tag.value.as_ref().map(|value| value.atom), Some(v));
        assert_eq!(tag.name.len(), 5);
    }

    #[test]
    fn newest_entity_atom_wins_without_loser_tags() {
        let mut b = Builder::new();
        let older = b.entity("file");
        let t = b.tag(older, "size");
        b.value(t, json!(1));
        let newer = b.entity("file");

        let state = b.eval();
        assert_eq!(state.len(), 1);
        let file = state.get("file").expect("entity");
        assert_eq!(file.metadata.atom, newer);
        assert!(file.tags.is_empty());
    }

    #[test]
    fn deleted_entity_is_hidden_and_older_duplicate_resurfaces() {
        let mut b = Builder::new();
        let older = b.entity("file");
        let newer = b.entity("file");
        b.delete(newer);
        assert_eq!(b.eval().get("file").map(|e| e.metadata.atom), Some(older));

        b.delete(older);
        assert!(b.eval().is_empty());
    }

    #[test]
    fn newest_value_wins() {
        let mut b = Builder::new();
        let e = b.entity("bot");
        let t = b.tag(e, "n");
        b.value(t, json!(1));
        b.value(t, json!(2));
        assert_eq!(b.eval().get("bot").and_then(|e| e.tag("n")), Some(&json!(2)));
    }

    #[test]
    fn deleting_newest_value_clears_tag() {
        let mut b = Builder::new();
        let e = b.entity("bot");
        let t = b.tag(e, "n");
        b.value(t, json!(1));
        let second = b.value(t, json!(2));
        b.delete(second);

        let state = b.eval();
        let bot = state.get("bot").expect("entity");
        assert!(bot.tag("n").is_none());
        assert!(bot.metadata.tags["n"].value.is_none());

        // A newer value brings the tag back.
        b.value(t, json!(3));
        assert_eq!(b.eval().get("bot").and_then(|e| e.tag("n")), Some(&json!(3)));
    }

    #[test]
    fn empty_values_keep_metadata_only() {
        let mut b = Builder::new();
        let e = b.entity("bot");
        for (name, value) in [
            ("nothing", json!(null)),
            ("blank", json!("")),
            ("space", json!("  ")),
        ] {
            let t = b.tag(e, name);
            b.value(t, value);
        }
        let bare = b.tag(e, "bare");

        let state = b.eval();
        let bot = state.get("bot").expect("entity");
        assert_eq!(bot.tags.len(), 1);
        assert_eq!(bot.tag("space"), Some(&json!("  ")));
        assert!(bot.metadata.tags["nothing"].value.is_some());
        assert!(bot.metadata.tags["blank"].value.is_some());
        assert_eq!(bot.metadata.tags["bare"].atom, bare);
        assert!(bot.metadata.tags["bare"].value.is_none());
    }

    #[test]
    fn deleted_tag_is_skipped_and_older_tag_wins() {
        let mut b = Builder::new();
        let e = b.entity("bot");
        let older = b.tag(e, "label");
        b.value(older, json!("old"));
        let newer = b.tag(e, "label");
        b.value(newer, json!("new"));
        assert_eq!(b.eval().get("bot").and_then(|e| e.tag("label")), Some(&json!("new")));

        b.delete(newer);
        let state = b.eval();
        let bot = state.get("bot").expect("entity");
        assert_eq!(bot.tag("label"), Some(&json!("old")));
        assert_eq!(bot.metadata.tags["label"].atom, older);
    }

    #[test]
    fn renamed_tag_uses_resolved_name() {
        let mut b = Builder::new();
        let e = b.entity("bot");
        let t = b.tag(e, "abc");
        b.value(t, json!(5));
        b.add_from(
            1,
            t,
            AuxOp::Delete {
                start: Some(0),
                end: Some(3),
            },
            1,
        );
        b.add_from(
            1,
            t,
            AuxOp::Insert {
                index: 0,
                text: "xyz".into(),
            },
            0,
        );

        let state = b.eval();
        let bot = state.get("bot").expect("entity");
        assert_eq!(bot.tag("xyz"), Some(&json!(5)));
        assert!(bot.tag("abc").is_none());
    }

    #[test]
    fn tag_renamed_to_nothing_is_ignored() {
        let mut b = Builder::new();
        let e = b.entity("bot");
        let t = b.tag(e, "abc");
        b.add_from(
            1,
            t,
            AuxOp::Delete {
                start: None,
                end: Some(3),
            },
            1,
        );
        assert!(b.eval().get("bot").expect("entity").metadata.tags.is_empty());
    }
}
