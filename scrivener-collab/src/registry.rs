//! Maps document ids to live sessions.
//!
//! Sessions are created on first access and remove themselves once they
//! have been evicted. The map lock is only held to find or insert an
//! entry; loading a document happens inside that entry's cell, so
//! concurrent first accesses to one id wait for a single load while other
//! ids proceed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use scrivener_delta::Content;
use tokio::sync::{OnceCell, RwLock};

use crate::broadcast::Outbox;
use crate::protocol::{DocumentId, ParticipantId};
use crate::session::{DocumentSession, SessionConfig, SessionError, SessionHandle};
use crate::storage::{DocumentStore, StoreError};

/// Attempts at joining before giving up on sessions that keep closing.
const MAX_JOIN_ATTEMPTS: usize = 8;

type SessionMap = HashMap<DocumentId, Arc<OnceCell<SessionHandle>>>;

/// Registry of active document sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<SessionMap>>,
    store: Arc<dyn DocumentStore>,
    config: SessionConfig,
    generation: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            store,
            config,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Return the live session for `id`, loading the document and starting
    /// a session if there is none.
    pub async fn get_or_create(&self, id: &DocumentId) -> Result<SessionHandle, SessionError> {
        loop {
            let cell = self.cell(id).await;
            let handle = match cell.get_or_try_init(|| self.create(id)).await {
                Ok(handle) => handle.clone(),
                Err(e) => {
                    remove_if_unused(&self.sessions, id, &cell).await;
                    return Err(e);
                }
            };
            if !handle.is_closed() {
                return Ok(handle);
            }
            // Evicted but its watcher has not run yet.
            remove_if_current(&self.sessions, id, handle.generation()).await;
        }
    }

    /// The live session for `id`, if one exists. Never creates.
    pub async fn get(&self, id: &DocumentId) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .and_then(|cell| cell.get())
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Attach `participant` to the session for `id`.
    ///
    /// A session found while it is being evicted refuses the attach; the
    /// stale entry is dropped and a fresh session is loaded instead.
    pub async fn join(
        &self,
        id: &DocumentId,
        participant: ParticipantId,
        outbox: Outbox,
    ) -> Result<(SessionHandle, Content), SessionError> {
        let mut attempts = 0;
        loop {
            let session = self.get_or_create(id).await?;
            match session.attach(participant, outbox.clone()).await {
                Ok(content) => return Ok((session, content)),
                Err(SessionError::Closed) if attempts < MAX_JOIN_ATTEMPTS => {
                    attempts += 1;
                    log::debug!("Session {id} closed during join, retrying");
                    remove_if_current(&self.sessions, id, session.generation()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Detach `participant` from `id`. The session starts its idle grace
    /// once nobody is left.
    pub async fn release(&self, id: &DocumentId, participant: ParticipantId) {
        if let Some(session) = self.get(id).await {
            let _ = session.detach(participant).await;
        }
    }

    /// Flush and stop every live session.
    ///
    /// All sessions are attempted; the first failure is returned. A session
    /// whose flush failed stays registered and can be shut down again.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let handles: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions.values().filter_map(|cell| cell.get().cloned()).collect()
        };
        log::info!("Shutting down {} sessions", handles.len());

        let mut first_error = None;
        for handle in handles {
            match handle.shutdown().await {
                Ok(()) | Err(SessionError::Closed) => {
                    remove_if_current(&self.sessions, handle.id(), handle.generation()).await;
                }
                Err(e) => {
                    log::error!("Flushing {} on shutdown failed: {e}", handle.id());
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ids of documents with a live session, sorted.
    pub async fn active_documents(&self) -> Vec<DocumentId> {
        let sessions = self.sessions.read().await;
        let mut ids: Vec<DocumentId> = sessions
            .iter()
            .filter(|(_, cell)| cell.get().is_some_and(|handle| !handle.is_closed()))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|cell| cell.get().is_some_and(|handle| !handle.is_closed()))
            .count()
    }

    async fn cell(&self, id: &DocumentId) -> Arc<OnceCell<SessionHandle>> {
        if let Some(cell) = self.sessions.read().await.get(id) {
            return cell.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions.entry(id.clone()).or_default().clone()
    }

    async fn create(&self, id: &DocumentId) -> Result<SessionHandle, SessionError> {
        let store = self.store.clone();
        let load_id = id.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load(&load_id))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;

        let content = match loaded {
            Ok(record) => {
                log::info!("Loaded {id} (saved version {})", record.version);
                record.content
            }
            Err(StoreError::NotFound(_)) => {
                log::info!("Creating new document {id}");
                Content::new()
            }
            Err(e) => {
                log::error!("Failed to load {id}: {e}");
                return Err(e.into());
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (handle, task) =
            DocumentSession::spawn(id.clone(), generation, content, self.store.clone(), &self.config);

        let sessions = self.sessions.clone();
        let watched = id.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                log::error!("Session {watched} task failed: {e}");
            }
            remove_if_current(&sessions, &watched, generation).await;
        });

        Ok(handle)
    }
}

/// Remove the entry for `id` if it still belongs to session `generation`.
async fn remove_if_current(sessions: &RwLock<SessionMap>, id: &DocumentId, generation: u64) {
    let mut sessions = sessions.write().await;
    let current = sessions
        .get(id)
        .and_then(|cell| cell.get())
        .is_some_and(|handle| handle.generation() == generation);
    if current {
        sessions.remove(id);
        log::debug!("Removed session {id} (generation {generation})");
    }
}

/// Drop the entry for `id` after a failed load, unless another caller
/// is still holding its cell.
async fn remove_if_unused(
    sessions: &RwLock<SessionMap>,
    id: &DocumentId,
    cell: &Arc<OnceCell<SessionHandle>>,
) {
    let mut sessions = sessions.write().await;
    let unused = sessions.get(id).is_some_and(|entry| {
        // One reference in the map, one held by the caller.
        Arc::ptr_eq(entry, cell) && !entry.initialized() && Arc::strong_count(entry) <= 2
    });
    if unused {
        sessions.remove(id);
    }
}
