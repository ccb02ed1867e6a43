//! Normalized operation sequences.
//!
//! A [`Delta`] is built once and never changed afterwards: the builder
//! methods consume `self`, and [`Delta::compose`] returns a new value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InvalidDeltaError;
use crate::op::{compose_attributes, Attributes, InsertValue, Op, OpIter, OpKind, RawOp};

/// An edit: retains, inserts, deletes and formatting changes.
///
/// Deltas built through the API are normalized (zero-length ops dropped,
/// neighbours merged, inserts ordered before deletes, trailing plain
/// retains chopped). A delta deserialized from the wire keeps its ops as
/// sent so that [`Delta::validate`] can report malformed input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDelta")]
pub struct Delta {
    ops: Vec<Op>,
}

#[derive(Deserialize)]
struct RawDelta {
    ops: Vec<RawOp>,
}

impl TryFrom<RawDelta> for Delta {
    type Error = InvalidDeltaError;

    fn try_from(raw: RawDelta) -> Result<Self, Self::Error> {
        let ops = raw
            .ops
            .into_iter()
            .enumerate()
            .map(|(index, op)| {
                Op::try_from(op).map_err(|reason| InvalidDeltaError::Malformed { index, reason })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Delta { ops })
    }
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a normalized delta from raw ops.
    pub fn from_ops(ops: impl IntoIterator<Item = Op>) -> Self {
        let mut delta = Delta::new();
        for op in ops {
            delta.push(op);
        }
        delta
    }

    pub fn insert(self, text: impl Into<String>) -> Self {
        self.insert_with(InsertValue::Text(text.into()), None)
    }

    pub fn insert_with(mut self, value: InsertValue, attributes: Option<Attributes>) -> Self {
        self.push(Op::insert(value, attributes));
        self
    }

    pub fn retain(self, len: usize) -> Self {
        self.retain_with(len, None)
    }

    /// Retain `len` positions, applying `attributes` to them.
    pub fn retain_with(mut self, len: usize, attributes: Option<Attributes>) -> Self {
        self.push(Op::retain(len, attributes));
        self
    }

    pub fn delete(mut self, len: usize) -> Self {
        self.push(Op::delete(len));
        self
    }

    /// Decode a delta from editor JSON, keeping its ops as sent.
    ///
    /// An op with more than one of `insert`, `retain`, `delete` is reported
    /// as [`InvalidDeltaError::Malformed`].
    pub fn from_value(value: Value) -> Result<Self, InvalidDeltaError> {
        let raw: RawDelta = serde_json::from_value(value)
            .map_err(|e| InvalidDeltaError::Undecodable(e.to_string()))?;
        Delta::try_from(raw)
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of positions of the base document this delta reads
    /// (retains plus deletes).
    pub fn base_len(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| !op.is_insert())
            .fold(0usize, |acc, op| acc.saturating_add(op.len()))
    }

    /// Sum of insert lengths.
    pub fn insert_len(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| op.is_insert())
            .map(Op::len)
            .sum()
    }

    /// Structural checks on ops as received.
    pub fn validate(&self) -> Result<(), InvalidDeltaError> {
        for (index, op) in self.ops.iter().enumerate() {
            let reason = match op {
                Op::Retain { retain: 0, .. } => Some("zero-length retain"),
                Op::Delete { delete: 0 } => Some("zero-length delete"),
                Op::Insert {
                    insert: InsertValue::Text(text),
                    ..
                } if text.is_empty() => Some("empty text insert"),
                Op::Insert {
                    insert: InsertValue::Embed(embed),
                    ..
                } if embed.len() != 1 => Some("embed must have exactly one key"),
                _ => None,
            };
            if let Some(reason) = reason {
                return Err(InvalidDeltaError::Malformed { index, reason });
            }
        }
        Ok(())
    }

    /// Append an op, keeping the delta normalized.
    pub(crate) fn push(&mut self, op: Op) {
        if op.is_empty() {
            return;
        }
        let mut index = self.ops.len();
        if index > 0 {
            if let (Op::Delete { delete: last }, Op::Delete { delete }) =
                (&mut self.ops[index - 1], &op)
            {
                *last += *delete;
                return;
            }
            // Inserts go before a trailing delete.
            if self.ops[index - 1].is_delete() && op.is_insert() {
                index -= 1;
                if index == 0 {
                    self.ops.insert(0, op);
                    return;
                }
            }
            if self.ops[index - 1].try_merge(&op) {
                return;
            }
        }
        self.ops.insert(index, op);
    }

    /// Drop a trailing plain retain.
    fn chop(mut self) -> Self {
        if let Some(Op::Retain {
            attributes: None, ..
        }) = self.ops.last()
        {
            self.ops.pop();
        }
        self
    }

    /// Append `other`'s ops, normalizing at the seam.
    pub fn concat(&self, other: &Delta) -> Delta {
        let mut delta = self.clone();
        if let Some((first, rest)) = other.ops.split_first() {
            delta.push(first.clone());
            delta.ops.extend_from_slice(rest);
        }
        delta
    }

    /// The delta equivalent to applying `self` and then `other`.
    pub fn compose(&self, other: &Delta) -> Delta {
        let mut this_iter = OpIter::new(&self.ops);
        let mut other_iter = OpIter::new(&other.ops);
        let mut delta = Delta::new();

        // Leading plain retain: copy our inserts through untouched.
        if let Some(Op::Retain {
            retain,
            attributes: None,
        }) = other_iter.peek()
        {
            let first_retain = *retain;
            let mut first_left = first_retain;
            while this_iter.peek_kind() == OpKind::Insert && this_iter.peek_len() <= first_left {
                first_left -= this_iter.peek_len();
                delta.ops.push(this_iter.next_op());
            }
            if first_retain > first_left {
                other_iter.next_len(first_retain - first_left);
            }
        }

        while this_iter.has_next() || other_iter.has_next() {
            if other_iter.peek_kind() == OpKind::Insert {
                delta.push(other_iter.next_op());
                continue;
            }
            if this_iter.peek_kind() == OpKind::Delete {
                delta.push(this_iter.next_op());
                continue;
            }

            let len = this_iter.peek_len().min(other_iter.peek_len());
            let this_op = this_iter.next_len(len);
            let other_op = other_iter.next_len(len);

            match (this_op, other_op) {
                (this_op, Op::Retain { attributes, .. }) => {
                    let composed = match this_op {
                        Op::Retain {
                            attributes: base, ..
                        } => Op::retain(
                            len,
                            compose_attributes(base.as_ref(), attributes.as_ref(), true),
                        ),
                        Op::Insert {
                            insert,
                            attributes: base,
                        } => Op::insert(
                            insert,
                            compose_attributes(base.as_ref(), attributes.as_ref(), false),
                        ),
                        Op::Delete { .. } => continue,
                    };
                    delta.push(composed.clone());

                    // Nothing left to change: the rest of `self` passes through.
                    if !other_iter.has_next() && delta.ops.last() == Some(&composed) {
                        let rest = Delta {
                            ops: this_iter.rest(),
                        };
                        return delta.concat(&rest).chop();
                    }
                }
                (Op::Retain { .. }, delete @ Op::Delete { .. }) => delta.push(delete),
                // Deleting something we inserted cancels out.
                _ => {}
            }
        }

        delta.chop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn attrs(value: Value) -> Option<Attributes> {
        Some(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_builder_normalizes() {
        let delta = Delta::new()
            .insert("ab")
            .insert("")
            .insert("cd")
            .retain(0)
            .delete(1)
            .delete(2);
        assert_eq!(delta.ops(), &[Op::insert("abcd", None), Op::delete(3)]);
    }

    #[test]
    fn test_insert_moves_before_delete() {
        let delta = Delta::new().retain(1).delete(2).insert("x");
        assert_eq!(
            delta.ops(),
            &[Op::retain(1, None), Op::insert("x", None), Op::delete(2)]
        );

        let delta = Delta::new().delete(2).insert("x");
        assert_eq!(delta.ops(), &[Op::insert("x", None), Op::delete(2)]);
    }

    #[test]
    fn test_differently_formatted_inserts_do_not_merge() {
        let delta = Delta::new()
            .insert("a")
            .insert_with("b".into(), attrs(json!({"bold": true})));
        assert_eq!(delta.ops().len(), 2);
    }

    #[test]
    fn test_json_roundtrip_shape() {
        let delta = Delta::new()
            .retain(2)
            .insert_with("x".into(), attrs(json!({"bold": true})))
            .delete(1);
        let value = serde_json::to_value(&delta).unwrap();
        assert_eq!(
            value,
            json!({"ops": [
                {"retain": 2},
                {"insert": "x", "attributes": {"bold": true}},
                {"delete": 1}
            ]})
        );
    }

    #[test]
    fn test_base_len() {
        let delta = Delta::new().retain(3).insert("abc").delete(2);
        assert_eq!(delta.base_len(), 5);
        assert_eq!(delta.insert_len(), 3);
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let raw: Delta = serde_json::from_value(json!({"ops": [{"retain": 0}]})).unwrap();
        assert!(matches!(
            raw.validate(),
            Err(InvalidDeltaError::Malformed { index: 0, .. })
        ));

        let raw: Delta =
            serde_json::from_value(json!({"ops": [{"retain": 1}, {"insert": ""}]})).unwrap();
        assert!(matches!(
            raw.validate(),
            Err(InvalidDeltaError::Malformed { index: 1, .. })
        ));

        let raw: Delta =
            serde_json::from_value(json!({"ops": [{"insert": {"a": 1, "b": 2}}]})).unwrap();
        assert!(raw.validate().is_err());

        let ok: Delta =
            serde_json::from_value(json!({"ops": [{"insert": {"image": "x.png"}}]})).unwrap();
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_from_value_rejects_ambiguous_ops() {
        let err = Delta::from_value(json!({"ops": [{"insert": "x", "delete": 1}]})).unwrap_err();
        assert!(matches!(err, InvalidDeltaError::Malformed { index: 0, .. }));

        let err =
            Delta::from_value(json!({"ops": [{"retain": 3}, {"retain": 1, "delete": 2}]}))
                .unwrap_err();
        assert!(matches!(err, InvalidDeltaError::Malformed { index: 1, .. }));

        assert!(serde_json::from_value::<Delta>(json!({"ops": [{"insert": "x", "delete": 1}]})).is_err());
        assert!(matches!(
            Delta::from_value(json!({"ops": 3})),
            Err(InvalidDeltaError::Undecodable(_))
        ));

        let ok = Delta::from_value(json!({"ops": [{"retain": 1}, {"insert": "x"}]})).unwrap();
        assert_eq!(ok, Delta::new().retain(1).insert("x"));
    }

    #[test]
    fn test_compose_insert_insert() {
        let a = Delta::new().insert("A");
        let b = Delta::new().insert("B");
        assert_eq!(a.compose(&b), Delta::new().insert("BA"));
    }

    #[test]
    fn test_compose_insert_then_retain_insert() {
        let a = Delta::new().insert("Hello");
        let b = Delta::new().retain(5).insert(" world");
        assert_eq!(a.compose(&b), Delta::new().insert("Hello world"));
    }

    #[test]
    fn test_compose_insert_delete_cancels() {
        let a = Delta::new().insert("abc");
        let b = Delta::new().retain(1).delete(1);
        assert_eq!(a.compose(&b), Delta::new().insert("ac"));

        let all = Delta::new().delete(3);
        assert!(a.compose(&all).is_empty());
    }

    #[test]
    fn test_compose_retain_format() {
        let a = Delta::new().insert("abc");
        let b = Delta::new().retain_with(2, attrs(json!({"bold": true})));
        assert_eq!(
            a.compose(&b),
            Delta::new()
                .insert_with("ab".into(), attrs(json!({"bold": true})))
                .insert("c")
        );
    }

    #[test]
    fn test_compose_remove_format() {
        let a = Delta::new().insert_with("ab".into(), attrs(json!({"bold": true})));
        let b = Delta::new().retain_with(1, attrs(json!({"bold": null})));
        assert_eq!(
            a.compose(&b),
            Delta::new()
                .insert("a")
                .insert_with("b".into(), attrs(json!({"bold": true})))
        );
    }

    #[test]
    fn test_compose_two_changes() {
        // Both deltas are changes, not documents.
        let a = Delta::new().retain(2).insert("x");
        let b = Delta::new().retain(1).delete(2);
        assert_eq!(a.compose(&b), Delta::new().retain(1).delete(1));
    }

    #[test]
    fn test_compose_delete_then_insert() {
        let a = Delta::new().delete(1);
        let b = Delta::new().insert("z");
        assert_eq!(a.compose(&b), Delta::new().insert("z").delete(1));
    }

    #[test]
    fn test_compose_is_associative_on_sample() {
        let doc = Delta::new().insert("The quick fox");
        let d1 = Delta::new().retain(4).delete(6);
        let d2 = Delta::new().retain(4).insert("slow ");
        let d3 = Delta::new().retain_with(3, attrs(json!({"italic": true})));

        let left = doc.compose(&d1).compose(&d2).compose(&d3);
        let right = doc.compose(&d1.compose(&d2).compose(&d3));
        assert_eq!(left, right);
    }

    #[test]
    fn test_concat_merges_seam() {
        let a = Delta::new().insert("ab");
        let b = Delta::new().insert("cd").delete(1);
        assert_eq!(a.concat(&b), Delta::new().insert("abcd").delete(1));
    }
}
