//! WebSocket participant client.
//!
//! Drives a [`Participant`] with a headless [`LocalEditor`] from a
//! background task:
//! - sends `get-document` on connect and keeps the editor read-only until
//!   the snapshot arrives
//! - applies remote changes to the local replica
//! - sends local edits immediately and a debounced `save-document`
//!
//! Application code talks to the task through [`ParticipantClient`] and
//! receives [`ParticipantEvent`]s from [`take_event_rx`](ParticipantClient::take_event_rx).

use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use scrivener_delta::{Content, Delta};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::participant::{LocalEditor, Participant, ParticipantError};
use crate::protocol::{ClientMessage, DocumentId, ProtocolError, ServerMessage};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Events emitted by the participant client.
#[derive(Debug, Clone, PartialEq)]
pub enum ParticipantEvent {
    /// Snapshot received; the editor is now writable
    Loaded(Content),
    /// A remote edit was applied to the local replica
    RemoteChanges(Delta),
    /// The hub replaced the local replica
    Resynced(Content),
    /// The hub reported an error
    ServerError(String),
    /// Connection lost
    Disconnected,
}

enum Command {
    Edit {
        delta: Delta,
        reply: oneshot::Sender<Result<(), ParticipantError>>,
    },
    Contents {
        reply: oneshot::Sender<Content>,
    },
    Disconnect,
}

/// A participant connected to a hub over WebSocket.
pub struct ParticipantClient {
    document: DocumentId,
    commands: mpsc::Sender<Command>,
    event_rx: Option<mpsc::Receiver<ParticipantEvent>>,
    task: JoinHandle<()>,
}

impl ParticipantClient {
    /// Connect to the hub at `url` and request `document`.
    pub async fn connect(
        url: &str,
        document: DocumentId,
        save_debounce: Duration,
    ) -> Result<Self, ParticipantError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(ProtocolError::from)?;
        log::info!("Connected to {url} for {document}");

        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let participant = Participant::new(document.clone(), LocalEditor::new(), save_debounce);
        let task = tokio::spawn(run(ws_stream, participant, command_rx, event_tx));

        Ok(Self {
            document,
            commands: command_tx,
            event_rx: Some(event_rx),
            task,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ParticipantEvent>> {
        self.event_rx.take()
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn is_connected(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Apply a user edit locally and send it to the hub.
    ///
    /// Fails with [`ParticipantError::NotReady`] until the snapshot has
    /// been loaded.
    pub async fn edit(&self, delta: Delta) -> Result<(), ParticipantError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Edit { delta, reply })
            .await
            .map_err(|_| ParticipantError::Disconnected)?;
        rx.await.map_err(|_| ParticipantError::Disconnected)?
    }

    /// Current contents of the local replica.
    pub async fn contents(&self) -> Result<Content, ParticipantError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Contents { reply })
            .await
            .map_err(|_| ParticipantError::Disconnected)?;
        rx.await.map_err(|_| ParticipantError::Disconnected)
    }

    /// Close the connection. A pending save is not sent.
    pub async fn disconnect(self) {
        let _ = self.commands.send(Command::Disconnect).await;
        if let Err(e) = self.task.await {
            log::error!("Participant task for {} failed: {e}", self.document);
        }
    }
}

async fn run(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut participant: Participant<LocalEditor>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ParticipantEvent>,
) {
    let (mut sink, mut source) = ws_stream.split();

    let get = participant.on_connected();
    if let Err(e) = send(&mut sink, &get).await {
        log::error!("Failed to request {}: {e}", participant.document());
    } else {
        loop {
            tokio::select! {
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = on_server_text(&mut participant, &mut sink, &events, text.as_str()).await {
                            log::warn!("Connection to hub failed: {e}");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Edit { delta, reply }) => {
                        let result = match participant.local_edit(delta) {
                            Ok(Some(message)) => send(&mut sink, &message).await.map_err(ParticipantError::from),
                            Ok(None) => Ok(()),
                            Err(e) => Err(e),
                        };
                        let _ = reply.send(result);
                    }
                    Some(Command::Contents { reply }) => {
                        let _ = reply.send(participant.contents());
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = participant.save_due() => {
                    let save = participant.save_message();
                    if let Err(e) = send(&mut sink, &save).await {
                        log::warn!("Failed to send save for {}: {e}", participant.document());
                        break;
                    }
                }
            }
        }
    }

    participant.on_disconnected();
    commands.close();
    emit(&events, ParticipantEvent::Disconnected);
    log::info!("Disconnected from {}", participant.document());
}

async fn on_server_text(
    participant: &mut Participant<LocalEditor>,
    sink: &mut WsSink,
    events: &mpsc::Sender<ParticipantEvent>,
    text: &str,
) -> Result<(), ProtocolError> {
    let message = match ServerMessage::decode(text) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Ignoring frame from hub: {e}");
            return Ok(());
        }
    };

    match message {
        ServerMessage::LoadDocument(content) => {
            participant.on_load(content.clone());
            emit(events, ParticipantEvent::Loaded(content));
        }
        ServerMessage::ReceiveChanges(delta) => match participant.on_remote_changes(&delta) {
            Ok(reply) => {
                if let Some(message) = reply {
                    send(sink, &message).await?;
                }
                emit(events, ParticipantEvent::RemoteChanges(delta));
            }
            Err(e) => {
                // Replica diverged; start over from a fresh snapshot.
                log::warn!("Cannot apply remote change to {}: {e}", participant.document());
                let get = participant.on_connected();
                send(sink, &get).await?;
            }
        },
        ServerMessage::ResyncDocument(content) => {
            participant.on_resync(content.clone());
            emit(events, ParticipantEvent::Resynced(content));
        }
        ServerMessage::Error { message } => {
            log::warn!("Hub error: {message}");
            emit(events, ParticipantEvent::ServerError(message));
        }
    }
    Ok(())
}

async fn send(sink: &mut WsSink, message: &ClientMessage) -> Result<(), ProtocolError> {
    let text = message.encode()?;
    sink.send(Message::text(text)).await?;
    Ok(())
}

fn emit(events: &mpsc::Sender<ParticipantEvent>, event: ParticipantEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        log::warn!("Participant event queue full, dropping {event:?}");
    }
}
