use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StorageError;

/// Durable record of a room's document
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub room_id: String,
    pub document_state: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

/// Load-by-key / upsert-by-key access to the opaque document blobs.
///
/// Implementations hold no per-room locks. There is exactly one in-memory
/// writer per room, so the upsert is the only coordination needed.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the stored record for a room, `None` if the room was never saved.
    async fn load(&self, room_id: &str) -> Result<Option<StoredDocument>, StorageError>;

    /// Overwrite (or create) the record for a room and return its new timestamp.
    async fn upsert(&self, room_id: &str, document_state: &[u8]) -> Result<DateTime<Utc>, StorageError>;
}
