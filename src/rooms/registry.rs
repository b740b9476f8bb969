use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use super::handle::{ChangeSubscription, DocumentHandle};
use super::retry::RetryExecutor;
use super::scheduler::PersistenceScheduler;
use crate::db::DocumentStore;

/// In-memory state of one open room.
struct DocumentSession {
    handle: DocumentHandle,
    /// Held while a save of this room is running.
    save_lock: Arc<AsyncMutex<()>>,
    /// Set when a save was skipped because another one was in flight.
    resave: Arc<AtomicBool>,
    subscription: ChangeSubscription,
    /// Set while the room is being closed; flips to `true` once it is done.
    closing: Option<watch::Receiver<bool>>,
}

/// Marks a room as closing until dropped, then wakes everyone waiting on it.
struct ClosingGuard {
    registry: DocumentRegistry,
    room_id: String,
    done: watch::Sender<bool>,
}

impl Drop for ClosingGuard {
    fn drop(&mut self) {
        // Still present only when the close was abandoned
        if let Some(session) = self.registry.sessions().get_mut(&self.room_id) {
            session.closing = None;
        }
        let _ = self.done.send(true);
    }
}

struct RegistryInner {
    store: Arc<dyn DocumentStore>,
    retry: RetryExecutor,
    scheduler: PersistenceScheduler,
    sessions: Mutex<HashMap<String, DocumentSession>>,
}

/// What a call to [`DocumentRegistry::save`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Another save of the room was already in flight.
    Skipped,
    /// The room is not open.
    NotActive,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub saving_rooms: usize,
    pub pending_saves: usize,
    pub bound_connections: usize,
}

/// Open documents keyed by room id.
///
/// The registry is the only writer of a room's stored state. Changes are
/// debounced through the [`PersistenceScheduler`] and written with the
/// [`RetryExecutor`]; storage failures are logged and never surface to callers.
#[derive(Clone)]
pub struct DocumentRegistry {
    inner: Arc<RegistryInner>,
}

impl DocumentRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, retry: RetryExecutor, scheduler: PersistenceScheduler) -> Self {
        debug!("[Persistence] Saves are debounced by {:?}", scheduler.debounce());
        Self {
            inner: Arc::new(RegistryInner {
                store,
                retry,
                scheduler,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, DocumentSession>> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle of an open room, without opening it.
    pub fn get(&self, room_id: &str) -> Option<DocumentHandle> {
        self.sessions().get(room_id).map(|s| s.handle.clone())
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.sessions().contains_key(room_id)
    }

    pub fn active_rooms(&self) -> Vec<String> {
        self.sessions().keys().cloned().collect()
    }

    /// Return the open document of a room, loading it from storage first if
    /// this is the first access.
    ///
    /// Never fails: a room whose stored state cannot be loaded or applied
    /// starts out empty.
    pub async fn get_or_create(&self, room_id: &str) -> DocumentHandle {
        loop {
            if let Some(handle) = self.settled(room_id).await {
                debug!("[Persistence] Returning active document for room {}", room_id);
                return handle;
            }

            let handle = self.hydrate(room_id).await;

            let weak = Arc::downgrade(&self.inner);
            let subscription = handle.subscribe(Arc::new(move |room: &str| {
                if let Some(inner) = weak.upgrade() {
                    DocumentRegistry { inner }.on_change(room);
                }
            }));

            let mut sessions = self.sessions();
            match sessions.get(room_id) {
                Some(existing) if existing.closing.is_none() => {
                    // Lost a race with another first access; theirs is already live
                    debug!("[Persistence] Room {} was opened concurrently, adopting it", room_id);
                    return existing.handle.clone();
                }
                Some(_) => {
                    debug!("[Persistence] Room {} started closing while loading, retrying", room_id);
                    continue;
                }
                None => {}
            }
            sessions.insert(
                room_id.to_string(),
                DocumentSession {
                    handle: handle.clone(),
                    save_lock: Arc::new(AsyncMutex::new(())),
                    resave: Arc::new(AtomicBool::new(false)),
                    subscription,
                    closing: None,
                },
            );
            info!("[Persistence] Document for room {} is now active with persistence enabled", room_id);
            return handle;
        }
    }

    /// Live handle of an open room. Waits out a close in progress, after
    /// which the room is either gone (`None`) or kept open.
    async fn settled(&self, room_id: &str) -> Option<DocumentHandle> {
        loop {
            let mut done = match self.sessions().get(room_id) {
                None => return None,
                Some(session) => match &session.closing {
                    None => return Some(session.handle.clone()),
                    Some(done) => done.clone(),
                },
            };
            debug!("[Persistence] Room {} is closing, waiting before reopening it", room_id);
            let _ = done.wait_for(|closed| *closed).await;
        }
    }

    async fn hydrate(&self, room_id: &str) -> DocumentHandle {
        let handle = DocumentHandle::new(room_id);
        info!("[Persistence] Trying to load document for room {} from storage", room_id);

        let store = &self.inner.store;
        let loaded = self
            .inner
            .retry
            .execute(&format!("LoadDoc-{}", room_id), move || store.load(room_id))
            .await;

        match loaded {
            Ok(Some(record)) => match handle.hydrate(&record.document_state) {
                Ok(()) => {
                    info!(
                        "[Persistence] Document for room {} loaded ({} bytes, last saved {})",
                        record.room_id,
                        record.document_state.len(),
                        record.updated_at
                    );
                    handle
                }
                Err(e) => {
                    error!("[Persistence] CORRUPTION? {}", e);
                    warn!(
                        "[Persistence] Proceeding with an EMPTY document for room {}. Stored state was left untouched for inspection",
                        room_id
                    );
                    // A failed import may have applied part of the bytes
                    DocumentHandle::new(room_id)
                }
            },
            Ok(None) => {
                info!("[Persistence] Initializing new document for room {} (no prior state)", room_id);
                handle
            }
            Err(failure) => {
                error!("[Persistence] CRITICAL: Failed to load document for room {}: {}", room_id, failure);
                warn!("[Persistence] Proceeding with an empty document for room {}", room_id);
                handle
            }
        }
    }

    /// Change notification from a room's document.
    fn on_change(&self, room_id: &str) {
        let registry = self.clone();
        let room = room_id.to_string();
        self.inner.scheduler.on_change(room_id, move || async move {
            registry.save(&room).await;
        });
    }

    /// Write the current state of a room to storage.
    ///
    /// Does nothing if a save of the room is already running; that save's
    /// completion triggers a follow-up save instead.
    pub async fn save(&self, room_id: &str) -> SaveOutcome {
        let (handle, save_lock, resave) = match self.sessions().get(room_id) {
            Some(s) => (s.handle.clone(), s.save_lock.clone(), s.resave.clone()),
            None => {
                debug!("[Persistence] Save requested for inactive room {}", room_id);
                return SaveOutcome::NotActive;
            }
        };

        let outcome = {
            let _saving = match save_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    info!("[Persistence] Save for room {} already in progress. Skipping", room_id);
                    resave.store(true, Ordering::SeqCst);
                    return SaveOutcome::Skipped;
                }
            };
            self.persist(room_id, &handle).await
        };

        if resave.swap(false, Ordering::SeqCst) && self.contains(room_id) {
            debug!("[Persistence] Room {} changed during save, scheduling follow-up", room_id);
            self.on_change(room_id);
        }
        outcome
    }

    async fn persist(&self, room_id: &str, handle: &DocumentHandle) -> SaveOutcome {
        info!("[Persistence] Attempting to save document for room {}", room_id);

        let state = match handle.encode_state() {
            Ok(state) => state,
            Err(e) => {
                error!("[Persistence] {}", e);
                return SaveOutcome::Failed;
            }
        };

        let store = &self.inner.store;
        let state_ref = state.as_slice();
        match self
            .inner
            .retry
            .execute(&format!("SaveDoc-{}", room_id), move || store.upsert(room_id, state_ref))
            .await
        {
            Ok(updated_at) => {
                info!(
                    "[Persistence] Saved document for room {} ({} bytes). Last updated: {}",
                    room_id,
                    state.len(),
                    updated_at
                );
                SaveOutcome::Saved
            }
            Err(failure) => {
                // The next change will schedule another attempt
                error!("[Persistence] CRITICAL: Failed to save document for room {}: {}", room_id, failure);
                SaveOutcome::Failed
            }
        }
    }

    /// Flush a room one last time and drop it from memory.
    ///
    /// Waits for an in-flight save to finish so the final write reflects the
    /// latest state. Does nothing for a room that is not open. While the room
    /// is closing, [`DocumentRegistry::get_or_create`] waits and then loads it
    /// again from storage.
    pub async fn close(&self, room_id: &str) {
        self.close_room(room_id, None).await;
    }

    /// Close every open room. Must run before shutdown or the last debounce
    /// window of edits is lost.
    pub async fn close_all(&self) {
        let rooms = self.active_rooms();
        info!("[Persistence] Closing {} active rooms", rooms.len());
        for room_id in rooms {
            self.close(&room_id).await;
        }
    }

    /// Close rooms that have no bound connection and have been idle for at
    /// least `idle_timeout`. Returns the closed room ids.
    ///
    /// A room that gets a connection while its final save runs stays open.
    pub async fn evict_idle(&self, idle_timeout: Duration) -> Vec<String> {
        let candidates: Vec<String> = self
            .sessions()
            .iter()
            .filter(|(_, s)| s.closing.is_none() && is_idle(&s.handle, idle_timeout))
            .map(|(room_id, _)| room_id.clone())
            .collect();

        let mut evicted = Vec::new();
        for room_id in candidates {
            info!("[Persistence] Evicting idle room {}", room_id);
            if self.close_room(&room_id, Some(idle_timeout)).await {
                evicted.push(room_id);
            }
        }
        evicted
    }

    /// Shared body of `close` and `evict_idle`. With `idle_timeout` set the
    /// room is only closed if it is still idle and unbound. Returns whether
    /// the room was removed.
    async fn close_room(&self, room_id: &str, idle_timeout: Option<Duration>) -> bool {
        let started = {
            let mut sessions = self.sessions();
            match sessions.get_mut(room_id) {
                None => Err(None),
                Some(session) => match session.closing.clone() {
                    Some(done) => Err(Some(done)),
                    None if idle_timeout.is_some_and(|t| !is_idle(&session.handle, t)) => Err(None),
                    None => {
                        let (done, closing) = watch::channel(false);
                        session.closing = Some(closing);
                        Ok((session.handle.clone(), session.save_lock.clone(), done))
                    }
                },
            }
        };

        let (handle, save_lock, done) = match started {
            Ok(started) => started,
            Err(Some(mut in_progress)) => {
                debug!("[Persistence] Room {} is already closing", room_id);
                let _ = in_progress.wait_for(|closed| *closed).await;
                return false;
            }
            Err(None) => return false,
        };
        let guard = ClosingGuard {
            registry: self.clone(),
            room_id: room_id.to_string(),
            done,
        };

        if self.inner.scheduler.cancel(room_id) {
            info!("[Persistence] Cleared pending save for room {}", room_id);
        }

        info!("[Persistence] Closing document for room {}", room_id);
        {
            let _saving = save_lock.lock().await;
            self.persist(room_id, &handle).await;
        }

        let removed = {
            let mut sessions = self.sessions();
            if idle_timeout.is_some() && handle.connection_count() > 0 {
                None
            } else {
                sessions.remove(room_id)
            }
        };
        let Some(session) = removed else {
            info!("[Persistence] Room {} got a connection while closing, keeping it open", room_id);
            drop(guard);
            return false;
        };

        session.subscription.unsubscribe();
        // A change that raced the final save would only find a missing room
        self.inner.scheduler.cancel(room_id);
        drop(guard);
        info!("[Persistence] Document for room {} removed from active cache", room_id);
        true
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions = self.sessions();
        RegistryStats {
            active_rooms: sessions.len(),
            saving_rooms: sessions.values().filter(|s| s.save_lock.try_lock().is_err()).count(),
            pending_saves: self.inner.scheduler.pending_count(),
            bound_connections: sessions.values().map(|s| s.handle.connection_count()).sum(),
        }
    }
}

fn is_idle(handle: &DocumentHandle, idle_timeout: Duration) -> bool {
    handle.connection_count() == 0 && handle.idle_for() >= idle_timeout
}
