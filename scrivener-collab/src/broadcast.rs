//! Fan-out of encoded frames to the participants of one document.
//!
//! Each participant owns an unbounded outbox drained by its connection
//! task, so a slow socket never blocks the session that feeds it.
//! Frames are encoded once and shared between outboxes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::ParticipantId;

/// Encoded text frame, shared between all recipients.
pub type Frame = Arc<str>;

/// Sending half of a participant's outbox.
pub type Outbox = mpsc::UnboundedSender<Frame>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_participants: usize,
}

/// The participants attached to one document session.
///
/// Owned by the session task; no locking.
#[derive(Default)]
pub struct BroadcastGroup {
    participants: HashMap<ParticipantId, Outbox>,
    messages_sent: u64,
    messages_dropped: u64,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant, replacing any previous outbox it had.
    pub fn add(&mut self, participant: ParticipantId, outbox: Outbox) {
        self.participants.insert(participant, outbox);
    }

    pub fn remove(&mut self, participant: &ParticipantId) -> bool {
        self.participants.remove(participant).is_some()
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.participants.contains_key(participant)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Send `frame` to every participant except `origin`, in one pass.
    ///
    /// Participants whose outbox is closed are dropped from the group and
    /// returned.
    pub fn broadcast_except(&mut self, origin: &ParticipantId, frame: &Frame) -> Vec<ParticipantId> {
        let mut gone = Vec::new();
        for (participant, outbox) in &self.participants {
            if participant == origin {
                continue;
            }
            if outbox.send(frame.clone()).is_ok() {
                self.messages_sent += 1;
            } else {
                self.messages_dropped += 1;
                gone.push(*participant);
            }
        }
        for participant in &gone {
            self.participants.remove(participant);
        }
        gone
    }

    /// Send `frame` to one participant. Returns false (and drops the
    /// participant) if its outbox is closed or it is not attached.
    pub fn send_to(&mut self, participant: &ParticipantId, frame: &Frame) -> bool {
        let Some(outbox) = self.participants.get(participant) else {
            return false;
        };
        if outbox.send(frame.clone()).is_ok() {
            self.messages_sent += 1;
            true
        } else {
            self.messages_dropped += 1;
            self.participants.remove(participant);
            false
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            active_participants: self.participants.len(),
        }
    }
}
