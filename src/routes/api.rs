use crate::{
    handlers::{diagnostics, health_check, ready_check, room_export},
    state::AppState,
    ws::{presence::presence_handler, sync::{sync_handler, sync_root_handler}},
};
use axum::{routing::get, Router};
use std::sync::Arc;

/// Create API routes
pub fn create_api_routes(state: Arc<AppState>) -> Router {
    Router::<Arc<AppState>>::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/rooms/:room_id/export", get(room_export))
        .with_state(state)
}

/// Presence channel, served next to the API
pub fn create_presence_routes(state: Arc<AppState>) -> Router {
    Router::<Arc<AppState>>::new()
        .route("/presence", get(presence_handler))
        .with_state(state)
}

/// Sync channel; the request path names the room
pub fn create_sync_routes(state: Arc<AppState>) -> Router {
    Router::<Arc<AppState>>::new()
        .route("/", get(sync_root_handler))
        .route("/*room_id", get(sync_handler))
        .with_state(state)
}
