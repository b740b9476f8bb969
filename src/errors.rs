use thiserror::Error;

/// A single failed storage call. Every variant is considered transient and is
/// retried by the retry executor.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Raised once a storage operation has used up all of its attempts.
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempts: {last_error}")]
pub struct PersistentStorageFailure {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub last_error: StorageError,
}

/// Failures of the CRDT document itself.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// Bytes that could not be applied to a document.
    #[error("corrupt document state for room '{room_id}': {reason}")]
    CorruptState { room_id: String, reason: String },

    #[error("failed to encode document for room '{room_id}': {reason}")]
    Encode { room_id: String, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// A sync connection arrived without a room id.
    #[error("sync connection has no room id")]
    MissingRoomId,
}
