//! WebSocket synchronization hub.
//!
//! Architecture:
//! ```text
//! Participant A ──┐                        ┌── DocumentSession "doc1" ──► store
//!                 ├── connection tasks ────┤
//! Participant B ──┘   (one per socket)     └── DocumentSession "doc2" ──► store
//!        ▲                   │
//!        └──── outbox ◄──────┘  (load / receive-changes / resync frames)
//! ```
//!
//! Connection tasks decode frames and hand them to the document's session
//! without waiting on it; the session pushes frames back through the
//! participant's outbox. A connection is attached to at most one document
//! at a time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::broadcast::Frame;
use crate::config::HubConfig;
use crate::protocol::{ClientMessage, ParticipantId, ProtocolError, ServerMessage};
use crate::registry::SessionRegistry;
use crate::session::{SessionError, SessionHandle};
use crate::storage::{open_store, DocumentStore, StoreError};

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Text frames received from participants
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// The synchronization hub.
pub struct SyncHub {
    config: HubConfig,
    registry: SessionRegistry,
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
}

impl SyncHub {
    /// Create a hub with the store named by `config.storage`.
    pub fn new(config: HubConfig) -> Result<Self, HubError> {
        let store = open_store(&config.storage)?;
        Ok(Self::with_store(config, store))
    }

    /// Create a hub over an existing store.
    pub fn with_store(config: HubConfig, store: Arc<dyn DocumentStore>) -> Self {
        let registry = SessionRegistry::new(store, config.session_config());
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry,
            counters: Arc::new(Counters::default()),
            shutdown,
        }
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), HubError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync hub listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`shutdown`](Self::shutdown).
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HubError> {
        let mut stop = self.shutdown.subscribe();
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let connection = Connection {
                            participant: Uuid::new_v4(),
                            addr,
                            registry: self.registry.clone(),
                            counters: self.counters.clone(),
                            heartbeat: self.config.heartbeat(),
                            shutdown: self.shutdown.subscribe(),
                            attachment: None,
                        };
                        tokio::spawn(connection.handle(stream));
                    }
                    Err(e) => log::warn!("Accept failed: {e}"),
                },
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::info!("Sync hub stopped accepting connections");
        Ok(())
    }

    /// Stop accepting, close connections and flush every session.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.shutdown.send_replace(true);
        self.registry.shutdown().await?;
        Ok(())
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            active_sessions: self.registry.session_count().await,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }
}

/// The session a connection is attached to, and the frames it sends us.
struct Attachment {
    session: SessionHandle,
    frames: mpsc::UnboundedReceiver<Frame>,
}

/// Per-socket state.
struct Connection {
    participant: ParticipantId,
    addr: SocketAddr,
    registry: SessionRegistry,
    counters: Arc<Counters>,
    heartbeat: Duration,
    shutdown: watch::Receiver<bool>,
    attachment: Option<Attachment>,
}

impl Connection {
    async fn handle(mut self, stream: TcpStream) {
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);

        match self.run(stream).await {
            Ok(()) => log::info!("Participant {} ({}) disconnected", self.participant, self.addr),
            Err(e) => log::warn!("Participant {} ({}) dropped: {e}", self.participant, self.addr),
        }

        if let Some(attachment) = self.attachment.take() {
            let _ = attachment.session.detach(self.participant).await;
        }
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    async fn run(&mut self, stream: TcpStream) -> Result<(), ProtocolError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut source) = ws_stream.split();
        log::info!("Participant {} connected from {}", self.participant, self.addr);

        let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                incoming = source.next() => {
                    let message = match incoming {
                        Some(message) => message?,
                        None => return Ok(()),
                    };
                    last_seen = Instant::now();
                    match message {
                        Message::Text(text) => {
                            self.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                            self.counters.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);
                            if let Some(reply) = self.on_text(text.as_str()).await {
                                send_message(&mut sink, &reply).await?;
                            }
                        }
                        Message::Binary(_) => {
                            let reply = ServerMessage::error("binary frames are not supported");
                            send_message(&mut sink, &reply).await?;
                        }
                        Message::Ping(data) => sink.send(Message::Pong(data)).await?,
                        Message::Close(_) => return Ok(()),
                        Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
                frame = next_frame(&mut self.attachment) => match frame {
                    Some(frame) => sink.send(Message::text(frame.to_string())).await?,
                    None => {
                        log::debug!("Session of participant {} went away", self.participant);
                        self.attachment = None;
                    }
                },
                _ = heartbeat.tick() => {
                    let silent = last_seen.elapsed();
                    if silent >= self.heartbeat * 2 {
                        return Err(ProtocolError::ConnectionLost(silent));
                    }
                    sink.send(Message::Ping(Default::default())).await?;
                }
                _ = self.shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    /// Handle one text frame. Returns a reply for this participant only.
    async fn on_text(&mut self, text: &str) -> Option<ServerMessage> {
        let message = match ClientMessage::decode(text) {
            Ok(message) => message,
            Err(ProtocolError::InvalidDelta(e)) => {
                log::warn!("Undecodable delta from {}: {e}", self.participant);
                return match &self.attachment {
                    Some(attachment) => {
                        let _ = attachment.session.resync(self.participant).await;
                        None
                    }
                    None => Some(ServerMessage::error(format!("invalid delta: {e}"))),
                };
            }
            Err(e) => {
                log::warn!("Bad frame from {}: {e}", self.participant);
                return Some(ServerMessage::error(e.to_string()));
            }
        };

        match message {
            ClientMessage::GetDocument(id) => {
                if let Some(previous) = self.attachment.take() {
                    let _ = previous.session.detach(self.participant).await;
                }
                let (outbox, frames) = mpsc::unbounded_channel();
                match self.registry.join(&id, self.participant, outbox).await {
                    Ok((session, _)) => {
                        self.attachment = Some(Attachment { session, frames });
                        None
                    }
                    Err(e) => {
                        log::error!("Participant {} could not open {id}: {e}", self.participant);
                        Some(ServerMessage::error(format!("cannot open document {id}: {e}")))
                    }
                }
            }
            ClientMessage::SendChanges(delta) => {
                let Some(attachment) = &self.attachment else {
                    return Some(ServerMessage::error("send-changes before get-document"));
                };
                match attachment.session.apply_remote(delta, self.participant).await {
                    Ok(()) => None,
                    Err(e) => Some(ServerMessage::error(e.to_string())),
                }
            }
            ClientMessage::SaveDocument(content) => {
                let Some(attachment) = &self.attachment else {
                    return Some(ServerMessage::error("save-document before get-document"));
                };
                log::debug!(
                    "Save requested by {} for {} ({} positions)",
                    self.participant,
                    attachment.session.id(),
                    content.len()
                );
                match attachment.session.request_save().await {
                    Ok(()) => None,
                    Err(e) => Some(ServerMessage::error(e.to_string())),
                }
            }
        }
    }
}

async fn next_frame(attachment: &mut Option<Attachment>) -> Option<Frame> {
    match attachment {
        Some(attachment) => attachment.frames.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_message<S>(sink: &mut S, message: &ServerMessage) -> Result<(), ProtocolError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = message.encode()?;
    sink.send(Message::text(text)).await?;
    Ok(())
}
