//! Text reconstruction for the sequence CRDT nested inside tags and values.
//!
//! A *fragment* is the text carried by one atom: the initial tag name or
//! value, or an `Insert`'s text. A fragment's characters are addressed by
//! their local offset inside that atom, so edits never shift each other.
//!
//! Reconstructing a fragment:
//!
//! 1. Lay out its own characters, each tagged with `(owner, local offset)`.
//! 2. Tombstone the local ranges named by `Delete` children. A start below
//!    zero clamps to 0, an end past the text clamps to its length, and a
//!    missing bound means "from the start" or "to the end".
//! 3. Place each `Insert` child directly after the owner's character
//!    `index - 1`; index 0 places it at the front of the fragment. Each child
//!    is reconstructed the same way, however deep the chain goes. Tombstoned
//!    characters still anchor inserts.
//! 4. Drop tombstoned characters.
//!
//! Concurrent inserts at the same anchor end up oldest-first, and the result
//! depends only on which atoms are present.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atom::{Atom, AtomId};
use crate::model::op::AuxOp;
use crate::model::state::SequenceMeta;
use crate::weave::Weave;

/// Children of every atom, each list in weave order.
pub(crate) type ChildIndex<'a> = HashMap<AtomId, Vec<&'a Atom<AuxOp>>>;

pub(crate) fn child_index(weave: &Weave<AuxOp>) -> ChildIndex<'_> {
    let mut index: ChildIndex<'_> = HashMap::new();
    for atom in weave.atoms() {
        if let Some(cause) = atom.cause {
            index.entry(cause).or_default().push(atom);
        }
    }
    index
}

/// An edit position expressed against one atom's own text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRef {
    pub atom: AtomId,
    pub index: usize,
}

/// A run of characters owned by one atom, in that atom's local offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSpan {
    pub atom: AtomId,
    pub index: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Copy)]
struct Piece {
    owner: AtomId,
    local: usize,
    ch: char,
    deleted: bool,
}

/// Reconstruct the text rooted at `atom`, whose own text is `text`.
#[must_use]
pub(crate) fn resolve_text(
    children: &ChildIndex<'_>,
    atom: AtomId,
    text: &str,
) -> (String, SequenceMeta) {
    let pieces = fragment(children, atom, text);
    let mut out = String::new();
    let mut meta = SequenceMeta::default();
    for piece in pieces.into_iter().filter(|piece| !piece.deleted) {
        out.push(piece.ch);
        meta.indexes.push(piece.local);
        meta.refs.push(piece.owner);
    }
    (out, meta)
}

/// Resolve a value atom's content.
///
/// Unedited values come back unchanged. Strings get 1:1 metadata and other
/// scalars get none. Once edited, the value is stringified and rebuilt.
#[must_use]
pub(crate) fn resolve_value(
    children: &ChildIndex<'_>,
    atom: AtomId,
    value: &Value,
) -> (Value, Option<SequenceMeta>) {
    if !is_edited(children, atom) {
        return match value {
            Value::String(text) => (
                value.clone(),
                Some(SequenceMeta::identity(atom, text.chars().count())),
            ),
            _ => (value.clone(), None),
        };
    }

    let (text, meta) = resolve_text(children, atom, &stringify(value));
    (Value::String(text), Some(meta))
}

/// Text form of a value once it becomes editable.
#[must_use]
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn is_edited(children: &ChildIndex<'_>, atom: AtomId) -> bool {
    children.get(&atom).is_some_and(|kids| {
        kids.iter()
            .any(|kid| matches!(kid.value, AuxOp::Insert { .. }) || kid.value.is_range_delete())
    })
}

/// Work item for [`fragment`]: either a fragment still to expand or a
/// character ready to emit.
enum Task<'a> {
    Expand { owner: AtomId, text: &'a str },
    Emit(Piece),
}

/// Lay out the pieces of the fragment owned by `owner`, descendants spliced
/// in.
///
/// Insert chains nest once per typed character when appending, so the walk
/// keeps an explicit stack instead of recursing. Pieces are emitted in final
/// order: an insert anchored after character `i` is expanded right after it,
/// and inserts sharing an anchor are expanded in reverse weave order, the same
/// result as splicing each one directly behind its anchor.
fn fragment<'a>(children: &ChildIndex<'a>, owner: AtomId, text: &'a str) -> Vec<Piece> {
    let mut out = Vec::new();
    let mut stack = vec![Task::Expand { owner, text }];

    while let Some(task) = stack.pop() {
        match task {
            Task::Emit(piece) => out.push(piece),
            Task::Expand { owner, text } => {
                let layout = expand(children, owner, text);
                stack.extend(layout.into_iter().rev());
            }
        }
    }
    out
}

/// One fragment's own characters interleaved with its direct inserts, in
/// emission order.
fn expand<'a>(children: &ChildIndex<'a>, owner: AtomId, text: &'a str) -> Vec<Task<'a>> {
    let mut pieces: Vec<Piece> = text
        .chars()
        .enumerate()
        .map(|(local, ch)| Piece {
            owner,
            local,
            ch,
            deleted: false,
        })
        .collect();
    let len = pieces.len();

    let Some(kids) = children.get(&owner) else {
        return pieces.into_iter().map(Task::Emit).collect();
    };

    // slots[k] holds the inserts anchored before character k, in weave order.
    let mut slots: Vec<Vec<(AtomId, &'a str)>> = vec![Vec::new(); len + 1];
    for kid in kids.iter().copied() {
        match &kid.value {
            AuxOp::Delete { start, end } => {
                let start = start.map_or(0, |raw| clamp_offset(raw, len));
                let end = end.map_or(len, |raw| clamp_offset(raw, len));
                for piece in pieces.iter_mut().take(end).skip(start) {
                    piece.deleted = true;
                }
            }
            AuxOp::Insert { index, text } => {
                slots[clamp_offset(*index, len)].push((kid.id, text.as_str()));
            }
            _ => {}
        }
    }

    let mut layout = Vec::with_capacity(len + kids.len());
    let mut slots = slots.into_iter();
    push_slot(&mut layout, slots.next().unwrap_or_default());
    for piece in pieces {
        layout.push(Task::Emit(piece));
        push_slot(&mut layout, slots.next().unwrap_or_default());
    }
    layout
}

/// Inserts sharing an anchor come out oldest first: reverse weave order.
fn push_slot<'a>(layout: &mut Vec<Task<'a>>, slot: Vec<(AtomId, &'a str)>) {
    for (owner, text) in slot.into_iter().rev() {
        layout.push(Task::Expand { owner, text });
    }
}

fn clamp_offset(raw: i64, len: usize) -> usize {
    usize::try_from(raw).map_or(0, |offset| offset.min(len))
}

/// Translate a logical insert position into an atom-local one.
///
/// The returned ref inserts before character `index`; an index at or past
/// the end inserts after the last character. Empty metadata yields `None`.
#[must_use]
pub fn calculate_sequence_ref(meta: &SequenceMeta, index: usize) -> Option<SequenceRef> {
    let len = meta.len();
    if len == 0 {
        return None;
    }
    if index < len {
        return Some(SequenceRef {
            atom: meta.refs[index],
            index: meta.indexes[index],
        });
    }
    Some(SequenceRef {
        atom: meta.refs[len - 1],
        index: meta.indexes[len - 1] + 1,
    })
}

/// Split the logical range `[index, index + length)` into per-atom spans.
///
/// Consecutive characters owned by the same atom merge into one span; the
/// range is clamped to the text.
#[must_use]
pub fn calculate_sequence_refs(
    meta: &SequenceMeta,
    index: usize,
    length: usize,
) -> Vec<SequenceSpan> {
    let len = meta.len();
    let start = index.min(len);
    let end = index.saturating_add(length).min(len);

    let mut spans: Vec<SequenceSpan> = Vec::new();
    for i in start..end {
        let atom = meta.refs[i];
        let local = meta.indexes[i];
        match spans.last_mut() {
            Some(span) if span.atom == atom && local >= span.index => {
                span.length = local - span.index + 1;
            }
            _ => spans.push(SequenceSpan {
                atom,
                index: local,
                length: 1,
            }),
        }
    }
    spans
}
