use crate::ws::SessionCoordinator;

/// Shared state of the HTTP, presence and sync routers
pub struct AppState {
    pub coordinator: SessionCoordinator,
    /// Backend the documents are persisted to ("postgres" or "memory")
    pub storage_backend: &'static str,
}
