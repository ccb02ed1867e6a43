//! Participant role: a local replica bound to an editing widget.
//!
//! [`Participant`] holds no socket. It turns hub messages into widget calls
//! and user edits into outgoing messages, so the same logic drives the
//! WebSocket [`ParticipantClient`](crate::client::ParticipantClient) and
//! in-process tests.
//!
//! ```text
//!  connect ──► get-document          (widget disabled)
//!  load-document ──► set_contents    (widget enabled, ready)
//!  receive-changes ──► update_contents(origin = Remote)   never re-sent
//!  user edit ──► send-changes now, save-document after the debounce
//! ```

use std::time::Duration;

use scrivener_delta::{Content, Delta, InvalidDeltaError};
use thiserror::Error;

use crate::debounce::Debouncer;
use crate::protocol::{ClientMessage, DocumentId, ProtocolError};

/// Where a change to the widget came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Typed by the local user.
    User,
    /// Set programmatically, e.g. the initial load.
    Api,
    /// Received from another participant.
    Remote,
}

/// A change event raised by the widget.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChange {
    pub delta: Delta,
    /// Contents before the change.
    pub prior: Content,
    pub origin: ChangeOrigin,
}

/// The editing widget a participant drives.
pub trait EditorWidget {
    fn contents(&self) -> Content;

    fn set_contents(&mut self, content: Content, origin: ChangeOrigin);

    fn update_contents(
        &mut self,
        delta: &Delta,
        origin: ChangeOrigin,
    ) -> Result<TextChange, InvalidDeltaError>;

    /// Read-only while disabled.
    fn enable(&mut self, enabled: bool);

    fn is_enabled(&self) -> bool;
}

/// Headless [`EditorWidget`] keeping its contents in memory.
#[derive(Debug, Clone, Default)]
pub struct LocalEditor {
    content: Content,
    enabled: bool,
}

impl LocalEditor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EditorWidget for LocalEditor {
    fn contents(&self) -> Content {
        self.content.clone()
    }

    fn set_contents(&mut self, content: Content, _origin: ChangeOrigin) {
        self.content = content;
    }

    fn update_contents(
        &mut self,
        delta: &Delta,
        origin: ChangeOrigin,
    ) -> Result<TextChange, InvalidDeltaError> {
        let prior = self.content.clone();
        self.content.apply(delta)?;
        Ok(TextChange {
            delta: delta.clone(),
            prior,
            origin,
        })
    }

    fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Participant errors.
#[derive(Debug, Error)]
pub enum ParticipantError {
    #[error("document not loaded yet")]
    NotReady,

    #[error("invalid delta: {0}")]
    InvalidDelta(#[from] InvalidDeltaError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("disconnected from hub")]
    Disconnected,
}

/// Per-connection participant state.
pub struct Participant<E: EditorWidget> {
    document: DocumentId,
    editor: E,
    ready: bool,
    save_timer: Debouncer,
}

impl<E: EditorWidget> Participant<E> {
    pub fn new(document: DocumentId, editor: E, save_debounce: Duration) -> Self {
        let mut participant = Self {
            document,
            editor,
            ready: false,
            save_timer: Debouncer::new(save_debounce),
        };
        participant.editor.enable(false);
        participant
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn editor(&self) -> &E {
        &self.editor
    }

    /// True once the snapshot has been loaded.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn contents(&self) -> Content {
        self.editor.contents()
    }

    /// Connection (re)established. Returns the `get-document` to send.
    pub fn on_connected(&mut self) -> ClientMessage {
        self.ready = false;
        self.editor.enable(false);
        ClientMessage::GetDocument(self.document.clone())
    }

    pub fn on_load(&mut self, content: Content) {
        self.editor.set_contents(content, ChangeOrigin::Api);
        self.editor.enable(true);
        self.ready = true;
        log::debug!("Loaded {} ({} positions)", self.document, self.editor.contents().len());
    }

    /// Apply a delta made by someone else. The widget reports it with
    /// [`ChangeOrigin::Remote`], so it yields nothing to send.
    pub fn on_remote_changes(
        &mut self,
        delta: &Delta,
    ) -> Result<Option<ClientMessage>, ParticipantError> {
        if !self.ready {
            log::debug!("Ignoring changes for {} before load", self.document);
            return Ok(None);
        }
        let change = self.editor.update_contents(delta, ChangeOrigin::Remote)?;
        Ok(self.on_text_change(&change))
    }

    /// The hub rejected one of our deltas; take its snapshot.
    pub fn on_resync(&mut self, content: Content) {
        log::info!("Resynchronizing {}", self.document);
        self.editor.set_contents(content, ChangeOrigin::Api);
        if !self.ready {
            self.editor.enable(true);
            self.ready = true;
        }
    }

    /// Apply a local user edit through the widget and return what its
    /// change event produces: the `send-changes` to send now.
    pub fn local_edit(&mut self, delta: Delta) -> Result<Option<ClientMessage>, ParticipantError> {
        if !self.ready || !self.editor.is_enabled() {
            return Err(ParticipantError::NotReady);
        }
        let change = self.editor.update_contents(&delta, ChangeOrigin::User)?;
        Ok(self.on_text_change(&change))
    }

    /// Map a widget change to the message it should produce. Only changes
    /// made by the user are forwarded, and they (re)arm the save debounce.
    pub fn on_text_change(&mut self, change: &TextChange) -> Option<ClientMessage> {
        if change.origin != ChangeOrigin::User {
            return None;
        }
        self.save_timer.arm();
        Some(ClientMessage::SendChanges(change.delta.clone()))
    }

    pub fn save_pending(&self) -> bool {
        self.save_timer.is_armed()
    }

    /// Completes when the save debounce fires.
    pub async fn save_due(&mut self) {
        self.save_timer.fired().await
    }

    /// The `save-document` to send once the debounce fired.
    pub fn save_message(&self) -> ClientMessage {
        ClientMessage::SaveDocument(self.editor.contents())
    }

    /// Connection lost: back to read-only, pending save dropped.
    pub fn on_disconnected(&mut self) {
        self.ready = false;
        self.editor.enable(false);
        self.save_timer.cancel();
    }
}
