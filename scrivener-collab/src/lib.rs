//! # scrivener-collab: real-time document synchronization hub
//!
//! Participants edit a shared rich-text document over WebSocket; the hub
//! keeps the authoritative content per document, rebroadcasts every edit
//! and persists debounced snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐    WebSocket     ┌─────────────┐
//! │ ParticipantClient │ ◄──────────────► │  SyncHub    │
//! │ (per user)        │    JSON events   │  (central)  │
//! └────────┬──────────┘                  └──────┬──────┘
//!          │                                    │
//!          ▼                                    ▼
//! ┌───────────────────┐                ┌─────────────────┐
//! │ Participant       │                │ SessionRegistry │
//! │ + EditorWidget    │                └────────┬────────┘
//! └───────────────────┘                         │ one per document
//!                                      ┌────────┴────────┐
//!                                      │ DocumentSession │──► DocumentStore
//!                                      │ (actor task)    │   (debounced)
//!                                      └────────┬────────┘
//!                                               │
//!                                       ┌───────┴───────┐
//!                                       │ BroadcastGroup│
//!                                       │ (fan-out)     │
//!                                       └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire events and document ids
//! - [`session`]: per-document actor that applies edits, fans them out and saves them
//! - [`registry`]: lazy session creation and idle eviction
//! - [`server`]: WebSocket hub
//! - [`participant`] / [`client`]: participant role, headless and over WebSocket
//! - [`storage`]: memory, file and RocksDB document stores

pub mod broadcast;
pub mod client;
pub mod config;
pub mod debounce;
pub mod participant;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame, Outbox};
pub use client::{ParticipantClient, ParticipantEvent};
pub use config::{ConfigError, HubConfig, StorageBackend};
pub use debounce::Debouncer;
pub use participant::{
    ChangeOrigin, EditorWidget, LocalEditor, Participant, ParticipantError, TextChange,
};
pub use protocol::{ClientMessage, DocumentId, ParticipantId, ProtocolError, ServerMessage};
pub use registry::SessionRegistry;
pub use server::{HubError, HubStats, SyncHub};
pub use session::{
    DocumentSession, SessionConfig, SessionError, SessionHandle, SessionSnapshot,
};
pub use storage::{open_store, DocumentStore, FileStore, MemoryStore, SaveRecord, StoreError};

#[cfg(feature = "rocksdb")]
pub use storage::{RocksConfig, RocksStore};
