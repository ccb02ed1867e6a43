use thiserror::Error;

/// A delta that cannot be applied to a document.
///
/// Rejected deltas leave the target content untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidDeltaError {
    #[error("malformed op at index {index}: {reason}")]
    Malformed { index: usize, reason: &'static str },

    #[error("delta spans {required} positions but the content has only {length}")]
    OutOfRange { required: usize, length: usize },

    #[error("document content may only contain inserts (op {index} is not an insert)")]
    NotADocument { index: usize },

    #[error("undecodable delta: {0}")]
    Undecodable(String),
}
