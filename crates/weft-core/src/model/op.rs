//! Domain operations carried by atoms.
//!
//! On the wire every op is a JSON object tagged with a small integer:
//!
//! | tag | op       | fields                       |
//! |-----|----------|------------------------------|
//! | 0   | `root`   |                              |
//! | 1   | `entity` | `id`                         |
//! | 2   | `tag`    | `name`                       |
//! | 3   | `value`  | `value` (any JSON, may be absent) |
//! | 4   | `delete` | `start?`, `end?`             |
//! | 5   | `insert` | `index`, `text`              |

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of operations understood by the domain reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuxOp {
    Root,
    /// Creates the entity with the given logical id.
    Entity { id: String },
    /// Creates a tag slot on its parent entity.
    Tag { name: String },
    /// Sets the value of its parent tag. Absent values are `null`.
    Value { value: Value },
    /// Tombstones the parent (no range) or a local range of its text.
    Delete { start: Option<i64>, end: Option<i64> },
    /// Inserts text at a local index of the parent fragment.
    Insert { index: i64, text: String },
}

/// Discriminant of [`AuxOp`] with its stable wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Root,
    Entity,
    Tag,
    Value,
    Delete,
    Insert,
}

impl OpKind {
    pub const ALL: [Self; 6] = [
        Self::Root,
        Self::Entity,
        Self::Tag,
        Self::Value,
        Self::Delete,
        Self::Insert,
    ];

    #[must_use]
    pub const fn wire_tag(self) -> u8 {
        match self {
            Self::Root => 0,
            Self::Entity => 1,
            Self::Tag => 2,
            Self::Value => 3,
            Self::Delete => 4,
            Self::Insert => 5,
        }
    }

    #[must_use]
    pub const fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Root),
            1 => Some(Self::Entity),
            2 => Some(Self::Tag),
            3 => Some(Self::Value),
            4 => Some(Self::Delete),
            5 => Some(Self::Insert),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Entity => "entity",
            Self::Tag => "tag",
            Self::Value => "value",
            Self::Delete => "delete",
            Self::Insert => "insert",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors decoding an op from its wire form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpError {
    #[error("unknown op type {0}: expected 0 (root) through 5 (insert)")]
    UnknownType(u8),

    #[error("{kind} op is missing required field `{field}`")]
    MissingField { kind: OpKind, field: &'static str },
}

impl AuxOp {
    #[must_use]
    pub const fn kind(&self) -> OpKind {
        match self {
            Self::Root => OpKind::Root,
            Self::Entity { .. } => OpKind::Entity,
            Self::Tag { .. } => OpKind::Tag,
            Self::Value { .. } => OpKind::Value,
            Self::Delete { .. } => OpKind::Delete,
            Self::Insert { .. } => OpKind::Insert,
        }
    }

    /// A delete with neither bound removes its whole parent.
    #[must_use]
    pub const fn is_whole_delete(&self) -> bool {
        matches!(
            self,
            Self::Delete {
                start: None,
                end: None
            }
        )
    }

    /// A delete that tombstones a range of its parent's text.
    #[must_use]
    pub const fn is_range_delete(&self) -> bool {
        matches!(self, Self::Delete { .. }) && !self.is_whole_delete()
    }
}

// Wire shape shared by every op; fields not used by a kind are omitted.
#[derive(Serialize, Deserialize)]
struct RawOp {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

impl RawOp {
    const fn empty(kind: OpKind) -> Self {
        Self {
            kind: kind.wire_tag(),
            id: None,
            name: None,
            value: None,
            start: None,
            end: None,
            index: None,
            text: None,
        }
    }
}

fn required<T>(field: Option<T>, kind: OpKind, name: &'static str) -> Result<T, OpError> {
    field.ok_or(OpError::MissingField { kind, field: name })
}

impl TryFrom<RawOp> for AuxOp {
    type Error = OpError;

    fn try_from(raw: RawOp) -> Result<Self, Self::Error> {
        let kind = OpKind::from_wire_tag(raw.kind).ok_or(OpError::UnknownType(raw.kind))?;
        Ok(match kind {
            OpKind::Root => Self::Root,
            OpKind::Entity => Self::Entity {
                id: required(raw.id, kind, "id")?,
            },
            OpKind::Tag => Self::Tag {
                name: required(raw.name, kind, "name")?,
            },
            OpKind::Value => Self::Value {
                value: raw.value.unwrap_or(Value::Null),
            },
            OpKind::Delete => Self::Delete {
                start: raw.start,
                end: raw.end,
            },
            OpKind::Insert => Self::Insert {
                index: required(raw.index, kind, "index")?,
                text: required(raw.text, kind, "text")?,
            },
        })
    }
}

impl From<&AuxOp> for RawOp {
    fn from(op: &AuxOp) -> Self {
        let mut raw = Self::empty(op.kind());
        match op {
            AuxOp::Root => {}
            AuxOp::Entity { id } => raw.id = Some(id.clone()),
            AuxOp::Tag { name } => raw.name = Some(name.clone()),
            AuxOp::Value { value } => raw.value = Some(value.clone()),
            AuxOp::Delete { start, end } => {
                raw.start = *start;
                raw.end = *end;
            }
            AuxOp::Insert { index, text } => {
                raw.index = Some(*index);
                raw.text = Some(text.clone());
            }
        }
        raw
    }
}

impl Serialize for AuxOp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawOp::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AuxOp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawOp::deserialize(deserializer)?;
        Self::try_from(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_tags_are_stable() {
        let tags: Vec<u8> = OpKind::ALL.iter().map(|kind| kind.wire_tag()).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4, 5]);
        for kind in OpKind::ALL {
            assert_eq!(OpKind::from_wire_tag(kind.wire_tag()), Some(kind));
        }
        assert_eq!(OpKind::from_wire_tag(6), None);
    }

    #[test]
    fn serializes_with_type_tag() {
        let op = AuxOp::Insert {
            index: 3,
            text: "hi".into(),
        };
        assert_eq!(
            serde_json::to_value(&op).expect("encode"),
            json!({"type": 5, "index": 3, "text": "hi"})
        );
        assert_eq!(
            serde_json::to_value(AuxOp::Root).expect("encode"),
            json!({"type": 0})
        );
    }

    #[test]
    fn open_delete_omits_bounds() {
        let op = AuxOp::Delete {
            start: Some(2),
            end: None,
        };
        assert_eq!(
            serde_json::to_value(&op).expect("encode"),
            json!({"type": 4, "start": 2})
        );
        assert!(op.is_range_delete());
        assert!(!op.is_whole_delete());
    }

    #[test]
    fn decodes_each_kind() {
        let cases = [
            (json!({"type": 1, "id": "bot"}), OpKind::Entity),
            (json!({"type": 2, "name": "color"}), OpKind::Tag),
            (json!({"type": 3, "value": 99}), OpKind::Value),
            (json!({"type": 4}), OpKind::Delete),
        ];
        for (raw, kind) in cases {
            let op: AuxOp = serde_json::from_value(raw).expect("decode");
            assert_eq!(op.kind(), kind);
        }
    }

    #[test]
    fn absent_value_decodes_as_null() {
        let op: AuxOp = serde_json::from_value(json!({"type": 3})).expect("decode");
        assert_eq!(op, AuxOp::Value { value: Value::Null });
        let explicit: AuxOp =
            serde_json::from_value(json!({"type": 3, "value": null})).expect("decode");
        assert_eq!(explicit, op);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = serde_json::from_value::<AuxOp>(json!({"type": 9})).expect_err("unknown");
        assert!(err.to_string().contains("unknown op type 9"));
    }

    #[test]
    fn missing_field_is_rejected() {
        let err =
            serde_json::from_value::<AuxOp>(json!({"type": 5, "text": "x"})).expect_err("index");
        assert!(err.to_string().contains("`index`"));
    }
}
