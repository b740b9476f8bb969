use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::store::{DocumentStore, StoredDocument};
use crate::errors::StorageError;

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, StoredDocument>,
    failing_loads: u32,
    failing_upserts: u32,
    load_calls: u32,
    upsert_calls: u32,
}

/// Process-local document store.
///
/// Used when no database is configured; documents survive room close but not
/// a restart. Tests use it to inject transient failures.
#[derive(Default)]
pub struct MemoryDocs {
    state: Mutex<MemoryState>,
}

impl MemoryDocs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a panic elsewhere; the map itself is intact
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
impl MemoryDocs {
    /// Make the next `n` loads fail with a transient error.
    pub fn fail_next_loads(&self, n: u32) {
        self.lock().failing_loads = n;
    }

    /// Make the next `n` upserts fail with a transient error.
    pub fn fail_next_upserts(&self, n: u32) {
        self.lock().failing_upserts = n;
    }

    pub fn load_calls(&self) -> u32 {
        self.lock().load_calls
    }

    pub fn upsert_calls(&self) -> u32 {
        self.lock().upsert_calls
    }

    /// Raw bytes currently stored for a room.
    pub fn stored_bytes(&self, room_id: &str) -> Option<Vec<u8>> {
        self.lock().records.get(room_id).map(|r| r.document_state.clone())
    }

    /// Seed a record directly, bypassing the call counters.
    pub fn put_raw(&self, room_id: &str, bytes: Vec<u8>) {
        self.lock().records.insert(
            room_id.to_string(),
            StoredDocument {
                room_id: room_id.to_string(),
                document_state: bytes,
                updated_at: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl DocumentStore for MemoryDocs {
    async fn load(&self, room_id: &str) -> Result<Option<StoredDocument>, StorageError> {
        let mut state = self.lock();
        state.load_calls += 1;
        if state.failing_loads > 0 {
            state.failing_loads -= 1;
            return Err(StorageError::Unavailable("injected load failure".to_string()));
        }
        Ok(state.records.get(room_id).cloned())
    }

    async fn upsert(&self, room_id: &str, document_state: &[u8]) -> Result<DateTime<Utc>, StorageError> {
        let mut state = self.lock();
        state.upsert_calls += 1;
        if state.failing_upserts > 0 {
            state.failing_upserts -= 1;
            return Err(StorageError::Unavailable("injected upsert failure".to_string()));
        }
        let updated_at = Utc::now();
        state.records.insert(
            room_id.to_string(),
            StoredDocument {
                room_id: room_id.to_string(),
                document_state: document_state.to_vec(),
                updated_at,
            },
        );
        Ok(updated_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_room_loads_as_none() {
        let store = MemoryDocs::new();
        assert!(store.load("nope").await.unwrap().is_none());
        assert_eq!(store.load_calls(), 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_previous_state() {
        let store = MemoryDocs::new();
        store.upsert("r1", b"one").await.unwrap();
        store.upsert("r1", b"two").await.unwrap();

        let record = store.load("r1").await.unwrap().unwrap();
        assert_eq!(record.room_id, "r1");
        assert_eq!(record.document_state, b"two".to_vec());
        assert_eq!(store.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = MemoryDocs::new();
        store.fail_next_upserts(1);

        assert!(matches!(
            store.upsert("r1", b"x").await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(store.upsert("r1", b"x").await.is_ok());
    }
}
