//! JSON wire protocol between the hub and its participants.
//!
//! Every WebSocket text frame carries one event:
//! ```text
//! {"event": "<name>", "payload": <json>}
//!
//!   client → hub   get-document     "doc-id"
//!   hub → client   load-document    Content
//!   client → hub   send-changes     Delta
//!   hub → client   receive-changes  Delta
//!   client → hub   save-document    Content
//!   hub → client   resync-document  Content
//!   hub → client   error            {"message": "..."}
//! ```

use std::fmt;

use scrivener_delta::{Content, Delta, InvalidDeltaError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Longest accepted document id, in bytes.
pub const MAX_DOCUMENT_ID_LEN: usize = 512;

/// Identifies one connection for the lifetime of that connection.
pub type ParticipantId = Uuid;

/// Externally supplied name of one logical document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ProtocolError::InvalidDocumentId("empty".into()));
        }
        if id.len() > MAX_DOCUMENT_ID_LEN {
            return Err(ProtocolError::InvalidDocumentId(format!(
                "{} bytes, limit is {MAX_DOCUMENT_ID_LEN}",
                id.len()
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DocumentId {
    type Error = ProtocolError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages a participant sends to the hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    GetDocument(DocumentId),
    SendChanges(Delta),
    SaveDocument(Content),
}

/// Messages the hub sends to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    LoadDocument(Content),
    ReceiveChanges(Delta),
    ResyncDocument(Content),
    Error { message: String },
}

/// Envelope decoded before the payload, so a bad payload can be told
/// apart from a bad frame.
#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    payload: Value,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode one text frame.
    ///
    /// A `send-changes` frame whose payload is not a delta yields
    /// [`ProtocolError::InvalidDelta`].
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: Frame =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match frame.event.as_str() {
            "get-document" => match frame.payload {
                Value::String(id) => Ok(ClientMessage::GetDocument(DocumentId::new(id)?)),
                other => Err(ProtocolError::InvalidDocumentId(format!(
                    "expected a string, got {other}"
                ))),
            },
            "send-changes" => Delta::from_value(frame.payload)
                .map(ClientMessage::SendChanges)
                .map_err(ProtocolError::from),
            "save-document" => serde_json::from_value(frame.payload)
                .map(ClientMessage::SaveDocument)
                .map_err(|e| ProtocolError::Malformed(format!("save-document: {e}"))),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),

    #[error("invalid delta: {0}")]
    InvalidDelta(#[from] InvalidDeltaError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("no message received for {0:?}")]
    ConnectionLost(std::time::Duration),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
