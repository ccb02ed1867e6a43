//! Single delta operations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Formatting attributes attached to a run or a retain.
///
/// In a retain, a `null` value removes the attribute.
pub type Attributes = BTreeMap<String, Value>;

/// What an insert puts into the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InsertValue {
    /// A run of text.
    Text(String),
    /// A single embedded object such as `{"image": "a.png"}`. Length 1.
    Embed(Map<String, Value>),
}

impl InsertValue {
    /// Length in document positions.
    pub fn len(&self) -> usize {
        match self {
            InsertValue::Text(text) => text.chars().count(),
            InsertValue::Embed(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            InsertValue::Text(text) => Some(text),
            InsertValue::Embed(_) => None,
        }
    }
}

impl From<&str> for InsertValue {
    fn from(text: &str) -> Self {
        InsertValue::Text(text.to_string())
    }
}

impl From<String> for InsertValue {
    fn from(text: String) -> Self {
        InsertValue::Text(text)
    }
}

/// Discriminant of an [`Op`], used by the compose iterators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Retain,
    Delete,
}

/// One delta operation.
///
/// Serialized in the editor's JSON shape: `{"insert": ..}`, `{"retain": n}`,
/// `{"delete": n}`, each insert/retain with optional `attributes`. An object
/// carrying more than one of the three keys does not decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, try_from = "RawOp")]
pub enum Op {
    Insert {
        insert: InsertValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    Retain {
        retain: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    Delete {
        delete: usize,
    },
}

impl Op {
    pub fn insert(value: impl Into<InsertValue>, attributes: Option<Attributes>) -> Self {
        Op::Insert {
            insert: value.into(),
            attributes: non_empty(attributes),
        }
    }

    pub fn retain(len: usize, attributes: Option<Attributes>) -> Self {
        Op::Retain {
            retain: len,
            attributes: non_empty(attributes),
        }
    }

    pub fn delete(len: usize) -> Self {
        Op::Delete { delete: len }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Op::Insert { .. } => OpKind::Insert,
            Op::Retain { .. } => OpKind::Retain,
            Op::Delete { .. } => OpKind::Delete,
        }
    }

    /// Length in document positions.
    pub fn len(&self) -> usize {
        match self {
            Op::Insert { insert, .. } => insert.len(),
            Op::Retain { retain, .. } => *retain,
            Op::Delete { delete } => *delete,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            Op::Insert { attributes, .. } | Op::Retain { attributes, .. } => attributes.as_ref(),
            Op::Delete { .. } => None,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Op::Insert { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Op::Delete { .. })
    }

    /// Merge `next` into `self` when both are text inserts or plain
    /// retains with equal attributes. Returns whether the merge happened.
    pub(crate) fn try_merge(&mut self, next: &Op) -> bool {
        if self.attributes() != next.attributes() {
            return false;
        }
        match (self, next) {
            (
                Op::Insert {
                    insert: InsertValue::Text(text),
                    ..
                },
                Op::Insert {
                    insert: InsertValue::Text(more),
                    ..
                },
            ) => {
                text.push_str(more);
                true
            }
            (Op::Retain { retain, .. }, Op::Retain { retain: more, .. }) => {
                *retain += *more;
                true
            }
            _ => false,
        }
    }

    /// Return the `[offset, offset + len)` slice of this op.
    pub(crate) fn slice(&self, offset: usize, len: usize) -> Op {
        match self {
            Op::Insert {
                insert: InsertValue::Text(text),
                attributes,
            } => Op::Insert {
                insert: InsertValue::Text(text.chars().skip(offset).take(len).collect()),
                attributes: attributes.clone(),
            },
            Op::Insert { .. } => self.clone(),
            Op::Retain { attributes, .. } => Op::Retain {
                retain: len,
                attributes: attributes.clone(),
            },
            Op::Delete { .. } => Op::Delete { delete: len },
        }
    }
}

/// An op as received, before its shape is checked.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawOp {
    insert: Option<InsertValue>,
    retain: Option<usize>,
    delete: Option<usize>,
    attributes: Option<Attributes>,
}

impl TryFrom<RawOp> for Op {
    type Error = &'static str;

    fn try_from(raw: RawOp) -> Result<Self, Self::Error> {
        match (raw.insert, raw.retain, raw.delete) {
            (Some(insert), None, None) => Ok(Op::Insert {
                insert,
                attributes: raw.attributes,
            }),
            (None, Some(retain), None) => Ok(Op::Retain {
                retain,
                attributes: raw.attributes,
            }),
            (None, None, Some(delete)) if raw.attributes.is_none() => Ok(Op::Delete { delete }),
            (None, None, Some(_)) => Err("delete cannot carry attributes"),
            (None, None, None) => Err("op has none of insert, retain, delete"),
            _ => Err("op has more than one of insert, retain, delete"),
        }
    }
}

fn non_empty(attributes: Option<Attributes>) -> Option<Attributes> {
    attributes.filter(|a| !a.is_empty())
}

/// Compose attribute `b` on top of `a`.
///
/// Keys present in `b` win. `null` values in `b` survive only when
/// `keep_null` is set (composing two retains); otherwise they erase the key.
pub fn compose_attributes(
    a: Option<&Attributes>,
    b: Option<&Attributes>,
    keep_null: bool,
) -> Option<Attributes> {
    let mut composed = b.cloned().unwrap_or_default();
    if !keep_null {
        composed.retain(|_, value| !value.is_null());
    }
    if let Some(a) = a {
        for (key, value) in a {
            let overridden = b.is_some_and(|b| b.contains_key(key));
            if !overridden {
                composed.insert(key.clone(), value.clone());
            }
        }
    }
    non_empty(Some(composed))
}

/// Iterator over a slice of ops that can split an op at any position.
///
/// An exhausted iterator behaves as an endless plain retain.
pub(crate) struct OpIter<'a> {
    ops: &'a [Op],
    index: usize,
    offset: usize,
}

impl<'a> OpIter<'a> {
    pub(crate) fn new(ops: &'a [Op]) -> Self {
        Self {
            ops,
            index: 0,
            offset: 0,
        }
    }

    pub(crate) fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    pub(crate) fn peek(&self) -> Option<&'a Op> {
        self.ops.get(self.index)
    }

    pub(crate) fn peek_len(&self) -> usize {
        match self.peek() {
            Some(op) => op.len() - self.offset,
            None => usize::MAX,
        }
    }

    pub(crate) fn peek_kind(&self) -> OpKind {
        self.peek().map_or(OpKind::Retain, Op::kind)
    }

    /// Take at most `len` positions from the current op.
    pub(crate) fn next_len(&mut self, len: usize) -> Op {
        let Some(op) = self.ops.get(self.index) else {
            return Op::Retain {
                retain: len,
                attributes: None,
            };
        };
        let offset = self.offset;
        let remaining = op.len() - offset;
        let take = if len >= remaining {
            self.index += 1;
            self.offset = 0;
            remaining
        } else {
            self.offset += len;
            len
        };
        if offset == 0 && take == op.len() {
            op.clone()
        } else {
            op.slice(offset, take)
        }
    }

    pub(crate) fn next_op(&mut self) -> Op {
        self.next_len(usize::MAX)
    }

    /// Everything not yet consumed, with a partially consumed op split.
    pub(crate) fn rest(&mut self) -> Vec<Op> {
        if !self.has_next() {
            return Vec::new();
        }
        if self.offset == 0 {
            let rest = self.ops[self.index..].to_vec();
            self.index = self.ops.len();
            return rest;
        }
        let mut rest = vec![self.next_op()];
        rest.extend_from_slice(&self.ops[self.index..]);
        self.index = self.ops.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_op_json_shapes() {
        let op: Op = serde_json::from_value(json!({"insert": "hi", "attributes": {"bold": true}})).unwrap();
        assert_eq!(op, Op::insert("hi", Some(attrs(json!({"bold": true})))));

        let op: Op = serde_json::from_value(json!({"insert": {"image": "a.png"}})).unwrap();
        assert_eq!(op.len(), 1);

        let op: Op = serde_json::from_value(json!({"retain": 3})).unwrap();
        assert_eq!(op, Op::retain(3, None));

        let op: Op = serde_json::from_value(json!({"delete": 2})).unwrap();
        assert_eq!(op, Op::delete(2));

        assert_eq!(serde_json::to_value(Op::retain(4, None)).unwrap(), json!({"retain": 4}));
    }

    #[test]
    fn test_unknown_op_shape_fails() {
        assert!(serde_json::from_value::<Op>(json!({"insert": 5})).is_err());
        assert!(serde_json::from_value::<Op>(json!({"retain": -1})).is_err());
        assert!(serde_json::from_value::<Op>(json!({"move": 1})).is_err());
    }

    #[test]
    fn test_op_with_two_kinds_fails() {
        assert!(serde_json::from_value::<Op>(json!({"insert": "x", "delete": 1})).is_err());
        assert!(serde_json::from_value::<Op>(json!({"retain": 1, "delete": 2})).is_err());
        assert!(serde_json::from_value::<Op>(json!({"delete": 1, "attributes": {"bold": true}})).is_err());
        assert!(serde_json::from_value::<Op>(json!({"attributes": {"bold": true}})).is_err());
    }

    #[test]
    fn test_len_counts_chars() {
        assert_eq!(Op::insert("héllo", None).len(), 5);
        assert_eq!(Op::insert("日本", None).len(), 2);
    }

    #[test]
    fn test_empty_attributes_become_none() {
        let op = Op::retain(1, Some(Attributes::new()));
        assert!(op.attributes().is_none());
    }

    #[test]
    fn test_compose_attributes() {
        let a = attrs(json!({"bold": true, "color": "red"}));
        let b = attrs(json!({"italic": true, "color": null}));

        let composed = compose_attributes(Some(&a), Some(&b), false).unwrap();
        assert_eq!(composed, attrs(json!({"bold": true, "italic": true})));

        let kept = compose_attributes(Some(&a), Some(&b), true).unwrap();
        assert_eq!(kept, attrs(json!({"bold": true, "italic": true, "color": null})));

        assert!(compose_attributes(None, Some(&attrs(json!({"bold": null}))), false).is_none());
    }

    #[test]
    fn test_iter_splits_text() {
        let ops = vec![Op::insert("hello", None), Op::delete(3)];
        let mut iter = OpIter::new(&ops);
        assert_eq!(iter.next_len(2), Op::insert("he", None));
        assert_eq!(iter.peek_len(), 3);
        assert_eq!(iter.next_len(10), Op::insert("llo", None));
        assert_eq!(iter.peek_kind(), OpKind::Delete);
        assert_eq!(iter.next_op(), Op::delete(3));
        assert!(!iter.has_next());
        assert_eq!(iter.peek_kind(), OpKind::Retain);
        assert_eq!(iter.next_len(4), Op::retain(4, None));
    }

    #[test]
    fn test_iter_rest_after_partial() {
        let ops = vec![Op::insert("abc", None), Op::retain(2, None)];
        let mut iter = OpIter::new(&ops);
        iter.next_len(1);
        assert_eq!(iter.rest(), vec![Op::insert("bc", None), Op::retain(2, None)]);
        assert!(!iter.has_next());
    }
}
