//! Garbage collection of superseded tag values.
//!
//! Under a tag only the newest value can ever be visible: a whole-range
//! delete on it clears the tag instead of exposing an older value. Every
//! value sibling placed after the newest one is therefore dead and is removed
//! together with its edit history.

use crate::atom::AtomId;
use crate::model::op::AuxOp;
use crate::model::sequence::child_index;
use crate::weave::Weave;

/// Roots of value subtrees shadowed by a newer value.
#[must_use]
pub fn superseded_values(weave: &Weave<AuxOp>) -> Vec<AtomId> {
    let children = child_index(weave);
    let mut dead = Vec::new();

    for tag in weave.atoms() {
        if !matches!(tag.value, AuxOp::Tag { .. }) {
            continue;
        }
        let Some(kids) = children.get(&tag.id) else {
            continue;
        };

        dead.extend(
            kids.iter()
                .filter(|kid| matches!(kid.value, AuxOp::Value { .. }))
                .skip(1)
                .map(|value| value.id),
        );
    }

    if !dead.is_empty() {
        tracing::debug!(count = dead.len(), "found superseded values");
    }
    dead
}
