//! # scrivener-delta: rich-text deltas and document content
//!
//! The edit model shared by the sync hub and its participants.
//!
//! ```text
//!   Delta (retain / insert / delete / format)
//!     │
//!     ├── compose(&Delta) ──► Delta        merge two edits into one
//!     │
//!     └── Content::apply(&Delta)           validate, then copy-on-write
//!              │
//!              ▼
//!         Content (typed runs: text | embed, with attributes)
//! ```
//!
//! Both types serialize to the editor's JSON delta format
//! (`{"ops":[{"insert":"hi","attributes":{"bold":true}},{"retain":2},{"delete":1}]}`).
//! Lengths are counted in `char`s; an embed counts as one.
//!
//! ## Modules
//!
//! - [`op`]: single operations and attribute composition
//! - [`delta`]: normalized op sequences, compose
//! - [`content`]: authoritative document content
//! - [`format`]: import/export interface for external document formats

pub mod content;
pub mod delta;
pub mod error;
pub mod format;
pub mod op;

pub use content::{Content, Run};
pub use delta::Delta;
pub use error::InvalidDeltaError;
pub use format::{ContentExporter, ContentImporter, FormatError, Html, PlainText};
pub use op::{Attributes, InsertValue, Op, OpKind};
