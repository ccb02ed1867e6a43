//! Authoritative document content.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::delta::Delta;
use crate::error::InvalidDeltaError;
use crate::op::{Attributes, InsertValue, Op};

/// A document: a sequence of typed runs (text or embed, each with optional
/// attributes).
///
/// Cloning is cheap; the run buffer is shared and only copied when a clone
/// applies a delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Delta", into = "Delta")]
pub struct Content {
    doc: Arc<Delta>,
    len: usize,
}

/// Borrowed view of one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Run<'a> {
    pub value: &'a InsertValue,
    pub attributes: Option<&'a Attributes>,
}

impl Content {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unformatted content holding `text`.
    pub fn from_text(text: &str) -> Self {
        let doc = Delta::new().insert(text);
        let len = doc.insert_len();
        Self {
            doc: Arc::new(doc),
            len,
        }
    }

    /// Length in positions (`char`s, embeds count one).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn runs(&self) -> impl Iterator<Item = Run<'_>> {
        self.doc.ops().iter().filter_map(|op| match op {
            Op::Insert { insert, attributes } => Some(Run {
                value: insert,
                attributes: attributes.as_ref(),
            }),
            _ => None,
        })
    }

    /// The text of every run, embeds left out.
    pub fn text(&self) -> String {
        self.runs().filter_map(|run| run.value.as_text()).collect()
    }

    /// The content as an all-insert delta.
    pub fn as_delta(&self) -> &Delta {
        &self.doc
    }

    /// Apply `delta` in place.
    ///
    /// The delta is checked before anything changes; on error the content
    /// is left as it was.
    pub fn apply(&mut self, delta: &Delta) -> Result<(), InvalidDeltaError> {
        delta.validate()?;
        let required = delta.base_len();
        if required > self.len {
            return Err(InvalidDeltaError::OutOfRange {
                required,
                length: self.len,
            });
        }
        if delta.is_empty() {
            return Ok(());
        }

        let next = self.doc.compose(delta);
        let len = next.insert_len();
        log::trace!(
            "applied delta of {} ops: {} -> {} positions",
            delta.ops().len(),
            self.len,
            len
        );
        self.doc = Arc::new(next);
        self.len = len;
        Ok(())
    }

    /// A copy of this content with `delta` applied.
    pub fn applied(&self, delta: &Delta) -> Result<Content, InvalidDeltaError> {
        let mut next = self.clone();
        next.apply(delta)?;
        Ok(next)
    }

    /// True if both values share the same run buffer.
    pub fn ptr_eq(&self, other: &Content) -> bool {
        Arc::ptr_eq(&self.doc, &other.doc)
    }
}

impl TryFrom<Delta> for Content {
    type Error = InvalidDeltaError;

    fn try_from(delta: Delta) -> Result<Self, Self::Error> {
        delta.validate()?;
        if let Some(index) = delta.ops().iter().position(|op| !op.is_insert()) {
            return Err(InvalidDeltaError::NotADocument { index });
        }
        let doc = Delta::from_ops(delta.ops().iter().cloned());
        let len = doc.insert_len();
        Ok(Self {
            doc: Arc::new(doc),
            len,
        })
    }
}

impl From<Content> for Delta {
    fn from(content: Content) -> Self {
        Arc::unwrap_or_clone(content.doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bold() -> Option<Attributes> {
        Some(serde_json::from_value(json!({"bold": true})).unwrap())
    }

    #[test]
    fn test_empty_content() {
        let content = Content::new();
        assert!(content.is_empty());
        assert_eq!(serde_json::to_value(&content).unwrap(), json!({"ops": []}));
    }

    #[test]
    fn test_apply_insert() {
        let mut content = Content::new();
        content.apply(&Delta::new().insert("hi")).unwrap();
        assert_eq!(content.text(), "hi");
        assert_eq!(content.len(), 2);
    }

    #[test]
    fn test_apply_out_of_range_leaves_content() {
        let mut content = Content::from_text("abc");
        let before = content.clone();
        let err = content.apply(&Delta::new().retain(2).delete(5)).unwrap_err();
        assert_eq!(
            err,
            InvalidDeltaError::OutOfRange {
                required: 7,
                length: 3
            }
        );
        assert_eq!(content, before);
    }

    #[test]
    fn test_apply_malformed_leaves_content() {
        let mut content = Content::from_text("abc");
        let raw: Delta = serde_json::from_value(json!({"ops": [{"delete": 0}]})).unwrap();
        assert!(matches!(
            content.apply(&raw),
            Err(InvalidDeltaError::Malformed { .. })
        ));
        assert_eq!(content.text(), "abc");
    }

    #[test]
    fn test_clone_is_copy_on_write() {
        let original = Content::from_text("abc");
        let mut edited = original.clone();
        assert!(edited.ptr_eq(&original));

        edited.apply(&Delta::new().retain(3).insert("d")).unwrap();
        assert!(!edited.ptr_eq(&original));
        assert_eq!(original.text(), "abc");
        assert_eq!(edited.text(), "abcd");
    }

    #[test]
    fn test_formatting_and_embeds() {
        let mut content = Content::from_text("hello");
        content
            .apply(&Delta::new().retain_with(2, bold()))
            .unwrap();
        content
            .apply(
                &Delta::new()
                    .retain(5)
                    .insert_with(InsertValue::Embed(serde_json::Map::from_iter([(
                        "image".to_string(),
                        json!("a.png"),
                    )])), None),
            )
            .unwrap();

        let runs: Vec<_> = content.runs().collect();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].value.as_text(), Some("he"));
        assert_eq!(runs[0].attributes, bold().as_ref());
        assert_eq!(content.len(), 6);
        assert_eq!(content.text(), "hello");
    }

    #[test]
    fn test_deserialize_rejects_changes() {
        let err = serde_json::from_value::<Content>(json!({"ops": [{"retain": 1}]}));
        assert!(err.is_err());

        let ok: Content =
            serde_json::from_value(json!({"ops": [{"insert": "a"}, {"insert": "b"}]})).unwrap();
        assert_eq!(ok.as_delta().ops().len(), 1);
        assert_eq!(ok.text(), "ab");
    }

    #[test]
    fn test_replicas_converge() {
        let deltas = [
            Delta::new().insert("Hello"),
            Delta::new().retain(5).insert(" world"),
            Delta::new().retain(6).delete(5).insert("there"),
            Delta::new().retain_with(5, bold()),
        ];

        let mut authority = Content::new();
        let mut replica = Content::new();
        for delta in &deltas {
            authority.apply(delta).unwrap();
        }
        for delta in &deltas {
            replica = replica.applied(delta).unwrap();
        }

        assert_eq!(authority, replica);
        assert_eq!(authority.text(), "Hello there");
    }
}
