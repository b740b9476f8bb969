use loro::{ExportMode, LoroDoc, ToJson};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::DocumentError;

/// Callback fired with the room id after every change to a document.
pub type ChangeListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Frames buffered per bound connection before a slow reader starts lagging.
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// An update to fan out to the sync connections bound to a room.
#[derive(Clone, Debug)]
pub struct SyncFrame {
    /// Connection that produced the update, `None` for server-side edits.
    pub origin: Option<u64>,
    pub bytes: Arc<Vec<u8>>,
}

struct HandleInner {
    room_id: String,
    doc: Mutex<LoroDoc>,
    listeners: Mutex<HashMap<u64, ChangeListener>>,
    next_listener_id: AtomicU64,
    frames: broadcast::Sender<SyncFrame>,
    connections: AtomicUsize,
    last_activity: Mutex<Instant>,
}

/// Shared handle to the CRDT document of one room.
///
/// Cloning is cheap; all clones point at the same document.
#[derive(Clone)]
pub struct DocumentHandle {
    inner: Arc<HandleInner>,
}

impl DocumentHandle {
    pub fn new(room_id: &str) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(HandleInner {
                room_id: room_id.to_string(),
                doc: Mutex::new(LoroDoc::new()),
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                frames,
                connections: AtomicUsize::new(0),
                last_activity: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    fn doc(&self) -> MutexGuard<'_, LoroDoc> {
        self.inner.doc.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load persisted bytes into the document without notifying anyone.
    pub fn hydrate(&self, bytes: &[u8]) -> Result<(), DocumentError> {
        self.doc()
            .import(bytes)
            .map(|_| ())
            .map_err(|e| DocumentError::CorruptState {
                room_id: self.inner.room_id.clone(),
                reason: e.to_string(),
            })
    }

    /// Apply an update received from a sync connection.
    ///
    /// On success the change listeners fire and the update is forwarded to the
    /// other connections bound to this room.
    pub fn apply_update(&self, bytes: Vec<u8>, origin: Option<u64>) -> Result<(), DocumentError> {
        self.doc().import(&bytes).map_err(|e| DocumentError::CorruptState {
            room_id: self.inner.room_id.clone(),
            reason: e.to_string(),
        })?;
        self.publish(bytes, origin);
        Ok(())
    }

    /// Run a server-side edit against the document and commit it.
    #[cfg(test)]
    pub fn edit<R>(&self, f: impl FnOnce(&LoroDoc) -> R) -> Result<R, DocumentError> {
        let (result, update) = {
            let doc = self.doc();
            let before = doc.oplog_vv();
            let result = f(&doc);
            doc.commit();
            if doc.oplog_vv() == before {
                (result, None)
            } else {
                let update = doc.export(ExportMode::updates(&before)).map_err(|e| DocumentError::Encode {
                    room_id: self.inner.room_id.clone(),
                    reason: e.to_string(),
                })?;
                (result, Some(update))
            }
        };
        if let Some(update) = update {
            self.publish(update, None);
        }
        Ok(result)
    }

    /// Serialize the full document state.
    pub fn encode_state(&self) -> Result<Vec<u8>, DocumentError> {
        self.doc().export(ExportMode::Snapshot).map_err(|e| DocumentError::Encode {
            room_id: self.inner.room_id.clone(),
            reason: e.to_string(),
        })
    }

    /// JSON view of the document content.
    pub fn to_json(&self) -> serde_json::Value {
        self.doc().get_deep_value().to_json_value()
    }

    fn publish(&self, bytes: Vec<u8>, origin: Option<u64>) {
        self.touch();
        // No receivers just means no connection is bound right now
        let _ = self.inner.frames.send(SyncFrame {
            origin,
            bytes: Arc::new(bytes),
        });
        self.notify();
    }

    fn notify(&self) {
        let listeners: Vec<ChangeListener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(&self.inner.room_id);
        }
    }

    /// Register a change listener. It stays active until the returned
    /// subscription is released or dropped.
    pub fn subscribe(&self, listener: ChangeListener) -> ChangeSubscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener);
        ChangeSubscription {
            handle: Arc::downgrade(&self.inner),
            id,
        }
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Receiver for the updates applied to this document.
    pub fn frames(&self) -> broadcast::Receiver<SyncFrame> {
        self.inner.frames.subscribe()
    }

    /// Mark a sync connection as bound to this room.
    pub fn lease(&self) -> ConnectionLease {
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        self.touch();
        debug!("Connection bound to room {}", self.inner.room_id);
        ConnectionLease { handle: self.clone() }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.inner
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    fn touch(&self) {
        *self.inner.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

/// Keeps a change listener registered on a document.
pub struct ChangeSubscription {
    handle: Weak<HandleInner>,
    id: u64,
}

impl ChangeSubscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.handle.upgrade() {
            let removed = inner
                .listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
            if removed.is_none() {
                warn!("Change listener {} already gone for room {}", self.id, inner.room_id);
            }
        }
    }
}

/// Held for as long as a sync connection is bound to a room.
pub struct ConnectionLease {
    handle: DocumentHandle,
}

impl ConnectionLease {
    pub fn handle(&self) -> &DocumentHandle {
        &self.handle
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.handle.inner.connections.fetch_sub(1, Ordering::SeqCst);
        self.handle.touch();
        debug!("Connection released from room {}", self.handle.inner.room_id);
    }
}

#[cfg(test)]
pub(crate) fn insert_text(handle: &DocumentHandle, text: &str) {
    handle
        .edit(|doc| {
            let t = doc.get_text("text");
            t.insert(t.len_unicode(), text).unwrap();
        })
        .unwrap();
}

#[cfg(test)]
pub(crate) fn read_text(handle: &DocumentHandle) -> String {
    handle.edit(|doc| doc.get_text("text").to_string()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_listener() -> (ChangeListener, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        (Arc::new(move |_room: &str| {
            c.fetch_add(1, Ordering::SeqCst);
        }), count)
    }

    #[test]
    fn new_document_is_empty() {
        let handle = DocumentHandle::new("r1");
        assert_eq!(read_text(&handle), "");
        assert_eq!(handle.room_id(), "r1");
    }

    #[test]
    fn edit_notifies_listeners_and_unsubscribe_stops_them() {
        let handle = DocumentHandle::new("r1");
        let (listener, count) = counting_listener();
        let sub = handle.subscribe(listener);

        insert_text(&handle, "hi");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        assert_eq!(handle.listener_count(), 0);
        insert_text(&handle, "!");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_only_edit_does_not_notify() {
        let handle = DocumentHandle::new("r1");
        let (listener, count) = counting_listener();
        let _sub = handle.subscribe(listener);

        let _ = read_text(&handle);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn encoded_state_round_trips_into_a_fresh_handle() {
        let source = DocumentHandle::new("r1");
        insert_text(&source, "hello");

        let copy = DocumentHandle::new("r1");
        copy.hydrate(&source.encode_state().unwrap()).unwrap();
        assert_eq!(read_text(&copy), "hello");
    }

    #[test]
    fn garbage_bytes_are_reported_as_corrupt() {
        let handle = DocumentHandle::new("r1");
        let err = handle.hydrate(b"definitely not a document").unwrap_err();
        assert!(matches!(err, DocumentError::CorruptState { .. }));
        assert_eq!(read_text(&handle), "");
    }

    #[tokio::test]
    async fn applied_updates_reach_other_bound_connections() {
        let author = DocumentHandle::new("r1");
        let mut author_frames = author.frames();
        insert_text(&author, "abc");
        let frame = author_frames.recv().await.unwrap();

        let server = DocumentHandle::new("r1");
        let mut frames = server.frames();
        let (listener, count) = counting_listener();
        let _sub = server.subscribe(listener);

        server.apply_update(frame.bytes.to_vec(), Some(7)).unwrap();
        let forwarded = frames.recv().await.unwrap();
        assert_eq!(forwarded.origin, Some(7));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(read_text(&server), "abc");
    }

    #[test]
    fn leases_track_bound_connections() {
        let handle = DocumentHandle::new("r1");
        let a = handle.lease();
        let b = handle.lease();
        assert_eq!(handle.connection_count(), 2);
        drop(a);
        assert_eq!(b.handle().connection_count(), 1);
        drop(b);
        assert_eq!(handle.connection_count(), 0);
    }
}
