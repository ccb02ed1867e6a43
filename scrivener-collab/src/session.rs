//! One actively edited document: authoritative content plus participants.
//!
//! ```text
//!   SessionHandle ──(bounded mpsc)──► DocumentSession task
//!    (cloneable)                        │
//!                                       ├─ Content (apply, version, dirty)
//!                                       ├─ BroadcastGroup ──► participant outboxes
//!                                       ├─ save timer  ──► spawn_blocking(store.save)
//!                                       └─ idle timer  ──► forced flush, evict
//! ```
//!
//! The session task is the only owner of the document state, so commands
//! are applied strictly one at a time in the order they were queued.
//! At most one write is in flight; a save requested meanwhile is folded
//! into a single follow-up write of the latest content.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use scrivener_delta::{Content, Delta};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};

use crate::broadcast::{BroadcastGroup, BroadcastStats, Frame, Outbox};
use crate::debounce::Debouncer;
use crate::protocol::{DocumentId, ParticipantId, ServerMessage};
use crate::storage::{DocumentStore, SaveRecord, StoreError};

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub save_debounce: Duration,
    pub idle_grace: Duration,
    pub queue_capacity: usize,
    pub max_participants: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(2000),
            idle_grace: Duration::from_secs(30),
            queue_capacity: 256,
            max_participants: 100,
        }
    }
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is shut down")]
    Closed,

    #[error("document already has {limit} participants")]
    Full { limit: usize },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub content: Content,
    /// Deltas applied since the session was created.
    pub version: u64,
    /// Version of the last successful write.
    pub saved_version: u64,
    pub dirty: bool,
    pub participants: usize,
    pub broadcast: BroadcastStats,
}

enum SessionCommand {
    Attach {
        participant: ParticipantId,
        outbox: Outbox,
        reply: oneshot::Sender<Result<Content, SessionError>>,
    },
    ApplyRemote {
        delta: Delta,
        origin: ParticipantId,
    },
    Detach {
        participant: ParticipantId,
    },
    RequestSave,
    Resync {
        participant: ParticipantId,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Flush {
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Cloneable address of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: DocumentId,
    generation: u64,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// Distinguishes successive sessions of the same document.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the session task has stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Join the session. The participant's outbox receives a
    /// `load-document` frame with the returned snapshot, followed by every
    /// later change made by other participants.
    pub async fn attach(
        &self,
        participant: ParticipantId,
        outbox: Outbox,
    ) -> Result<Content, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Attach {
            participant,
            outbox,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Queue a participant's edit. Not acknowledged.
    pub async fn apply_remote(&self, delta: Delta, origin: ParticipantId) -> Result<(), SessionError> {
        self.send(SessionCommand::ApplyRemote { delta, origin }).await
    }

    pub async fn detach(&self, participant: ParticipantId) -> Result<(), SessionError> {
        self.send(SessionCommand::Detach { participant }).await
    }

    /// Ask for a debounced save.
    pub async fn request_save(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::RequestSave).await
    }

    /// Send the full current content to one participant.
    pub async fn resync(&self, participant: ParticipantId) -> Result<(), SessionError> {
        self.send(SessionCommand::Resync { participant }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Write now if dirty. Returns whether a write happened.
    pub async fn flush(&self) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Flush { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Flush and stop the session. If the flush fails the session keeps
    /// running with its content and retries on its save timer.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Shutdown { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx.send(command).await.map_err(|_| SessionError::Closed)
    }
}

type WriteOutcome = (u64, Result<SaveRecord, StoreError>);

/// State owned by the session task.
pub struct DocumentSession {
    id: DocumentId,
    content: Content,
    version: u64,
    saved_version: u64,
    dirty: bool,
    participants: BroadcastGroup,
    max_participants: usize,
    store: Arc<dyn DocumentStore>,
    save_timer: Debouncer,
    idle_timer: Debouncer,
    write: Option<JoinHandle<WriteOutcome>>,
    save_pending: bool,
    rx: mpsc::Receiver<SessionCommand>,
}

impl DocumentSession {
    /// Start a session task for `id` holding `content`.
    ///
    /// The returned join handle completes when the session has been evicted
    /// or shut down. A session with no participants is evicted after
    /// `idle_grace`, so a session nobody attaches to does not linger.
    pub fn spawn(
        id: DocumentId,
        generation: u64,
        content: Content,
        store: Arc<dyn DocumentStore>,
        config: &SessionConfig,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let mut idle_timer = Debouncer::new(config.idle_grace);
        idle_timer.arm();

        let session = DocumentSession {
            id: id.clone(),
            content,
            version: 0,
            saved_version: 0,
            dirty: false,
            participants: BroadcastGroup::new(),
            max_participants: config.max_participants,
            store,
            save_timer: Debouncer::new(config.save_debounce),
            idle_timer,
            write: None,
            save_pending: false,
            rx,
        };
        let task = tokio::spawn(session.run());
        (SessionHandle { id, generation, tx }, task)
    }

    async fn run(mut self) {
        log::info!("Session {} started ({} positions)", self.id, self.content.len());

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => {
                        if self.handle(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        // Every handle is gone.
                        if let Err(e) = self.flush_now().await {
                            log::error!("Final flush of {} failed: {e}", self.id);
                        }
                        break;
                    }
                },
                outcome = join_write(&mut self.write) => {
                    self.write = None;
                    self.finish_write(outcome);
                }
                _ = self.save_timer.fired() => self.request_write(),
                _ = self.idle_timer.fired() => {
                    if self.try_evict().await {
                        break;
                    }
                }
            }
        }

        log::info!("Session {} closed at version {}", self.id, self.version);
    }

    async fn handle(&mut self, command: SessionCommand) -> ControlFlow<()> {
        match command {
            SessionCommand::Attach {
                participant,
                outbox,
                reply,
            } => {
                let _ = reply.send(self.attach(participant, outbox));
            }
            SessionCommand::ApplyRemote { delta, origin } => self.apply_remote(delta, origin),
            SessionCommand::Detach { participant } => self.detach(participant),
            SessionCommand::RequestSave => {
                if self.dirty && !self.save_timer.is_armed() && self.write.is_none() {
                    self.save_timer.arm();
                }
            }
            SessionCommand::Resync { participant } => self.resync(&participant),
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Flush { reply } => {
                let result = self.flush_now().await.map_err(SessionError::from);
                let _ = reply.send(result);
            }
            SessionCommand::Shutdown { reply } => {
                // Unsaved content keeps the session alive, as with eviction.
                if let Err(e) = self.flush_now().await {
                    log::error!(
                        "Keeping {} loaded, flush on shutdown failed with {} positions unsaved: {e}",
                        self.id,
                        self.content.len()
                    );
                    let _ = reply.send(Err(e.into()));
                    return ControlFlow::Continue(());
                }
                self.rx.close();
                let _ = reply.send(Ok(()));
                self.drain_closed();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn attach(&mut self, participant: ParticipantId, outbox: Outbox) -> Result<Content, SessionError> {
        if !self.participants.contains(&participant)
            && self.participants.len() >= self.max_participants
        {
            log::warn!("Session {} is full, refusing {participant}", self.id);
            return Err(SessionError::Full {
                limit: self.max_participants,
            });
        }

        let load = ServerMessage::LoadDocument(self.content.clone());
        let frame = encode(&load).ok_or(SessionError::Closed)?;
        self.participants.add(participant, outbox);
        self.participants.send_to(&participant, &frame);
        self.idle_timer.cancel();

        log::info!(
            "Participant {participant} attached to {} ({} attached)",
            self.id,
            self.participants.len()
        );
        Ok(self.content.clone())
    }

    fn apply_remote(&mut self, delta: Delta, origin: ParticipantId) {
        if !self.participants.contains(&origin) {
            log::warn!("Ignoring delta for {} from unattached {origin}", self.id);
            return;
        }

        if let Err(e) = self.content.apply(&delta) {
            log::warn!("Rejected delta from {origin} on {}: {e}", self.id);
            self.resync(&origin);
            return;
        }

        self.version += 1;
        self.dirty = true;
        self.save_timer.arm();

        if let Some(frame) = encode(&ServerMessage::ReceiveChanges(delta)) {
            for gone in self.participants.broadcast_except(&origin, &frame) {
                log::info!("Participant {gone} left {} (outbox closed)", self.id);
            }
        }
        if self.participants.is_empty() {
            self.idle_timer.arm();
        }
        log::trace!("{} now at version {}", self.id, self.version);
    }

    fn detach(&mut self, participant: ParticipantId) {
        if !self.participants.remove(&participant) {
            return;
        }
        log::info!(
            "Participant {participant} detached from {} ({} attached)",
            self.id,
            self.participants.len()
        );
        if self.participants.is_empty() {
            self.idle_timer.arm();
        }
    }

    fn resync(&mut self, participant: &ParticipantId) {
        let Some(frame) = encode(&ServerMessage::ResyncDocument(self.content.clone())) else {
            return;
        };
        if !self.participants.send_to(participant, &frame) {
            log::debug!("Resync for {participant} on {} not delivered", self.id);
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            content: self.content.clone(),
            version: self.version,
            saved_version: self.saved_version,
            dirty: self.dirty,
            participants: self.participants.len(),
            broadcast: self.participants.stats(),
        }
    }

    /// Save timer fired, or a save was requested.
    fn request_write(&mut self) {
        if !self.dirty {
            return;
        }
        if self.write.is_some() {
            self.save_pending = true;
            return;
        }
        self.start_write();
    }

    fn start_write(&mut self) {
        let store = self.store.clone();
        let id = self.id.clone();
        let content = self.content.clone();
        let version = self.version;
        log::debug!("Writing {} at version {version}", self.id);
        self.write = Some(tokio::task::spawn_blocking(move || {
            let result = store.save(&id, &content, version);
            (version, result)
        }));
    }

    fn finish_write(&mut self, outcome: Result<WriteOutcome, JoinError>) {
        match self.record_write(outcome) {
            Ok(()) => {
                if std::mem::take(&mut self.save_pending) && self.dirty {
                    self.start_write();
                }
            }
            Err(e) => {
                log::error!("Saving {} failed, retrying after debounce: {e}", self.id);
                self.save_pending = false;
                self.save_timer.arm();
            }
        }
    }

    fn record_write(&mut self, outcome: Result<WriteOutcome, JoinError>) -> Result<(), StoreError> {
        let (version, result) = outcome.map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        let record = result?;
        self.saved_version = self.saved_version.max(version);
        if version == self.version {
            self.dirty = false;
        }
        log::info!(
            "Saved {} at version {version} ({} positions)",
            self.id,
            record.content.len()
        );
        Ok(())
    }

    /// Wait for any write in flight, then write synchronously if still
    /// dirty. Returns whether this call wrote.
    async fn flush_now(&mut self) -> Result<bool, StoreError> {
        if let Some(handle) = self.write.take() {
            if let Err(e) = self.record_write(handle.await) {
                log::warn!("In-flight write of {} failed: {e}", self.id);
            }
        }
        self.save_pending = false;
        if !self.dirty {
            return Ok(false);
        }

        self.save_timer.cancel();
        self.start_write();
        let outcome = match self.write.take() {
            Some(handle) => handle.await,
            None => return Ok(false),
        };
        match self.record_write(outcome) {
            Ok(()) => Ok(true),
            Err(e) => {
                self.save_timer.arm();
                Err(e)
            }
        }
    }

    /// Idle grace expired. Returns true if the session should stop.
    async fn try_evict(&mut self) -> bool {
        if !self.participants.is_empty() {
            return false;
        }
        if let Err(e) = self.flush_now().await {
            log::error!("Keeping {} loaded, flush before eviction failed: {e}", self.id);
            self.idle_timer.arm();
            return false;
        }
        // Someone queued a command while we were writing.
        if !self.rx.is_empty() {
            self.idle_timer.arm();
            return false;
        }

        self.rx.close();
        self.drain_closed();
        log::info!("Session {} evicted after idle grace", self.id);
        true
    }

    /// Answer whatever was queued before the channel closed.
    fn drain_closed(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                SessionCommand::Attach { reply, .. } => {
                    let _ = reply.send(Err(SessionError::Closed));
                }
                SessionCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                SessionCommand::Flush { reply } => {
                    let _ = reply.send(Ok(false));
                }
                SessionCommand::Shutdown { reply } => {
                    let _ = reply.send(Ok(()));
                }
                SessionCommand::ApplyRemote { origin, .. } => {
                    log::warn!("Dropping delta from {origin}, {} is closing", self.id);
                }
                SessionCommand::Detach { .. }
                | SessionCommand::RequestSave
                | SessionCommand::Resync { .. } => {}
            }
        }
    }
}

async fn join_write(
    write: &mut Option<JoinHandle<WriteOutcome>>,
) -> Result<WriteOutcome, JoinError> {
    match write {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn encode(message: &ServerMessage) -> Option<Frame> {
    match message.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            log::error!("Failed to encode server message: {e}");
            None
        }
    }
}
