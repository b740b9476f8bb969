use crate::{models::{ErrorResponse, RoomExportResponse}, state::AppState};
use axum::{extract::{Path, State}, http::StatusCode, Json};
use std::sync::Arc;
use tracing::{debug, warn};

/// JSON view of an open room's document
pub async fn room_export(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<(StatusCode, Json<RoomExportResponse>), (StatusCode, Json<ErrorResponse>)> {
    debug!("Export requested for room {}", room_id);

    // Only rooms already open are exported; this never loads from storage
    let handle = match state.coordinator.registry().get(&room_id) {
        Some(handle) => handle,
        None => {
            warn!("Room '{}' is not active", room_id);
            return Err(ErrorResponse::reply(
                StatusCode::NOT_FOUND,
                format!("Room '{}' is not active", room_id),
            ));
        }
    };

    Ok((
        StatusCode::OK,
        Json(RoomExportResponse {
            room_id: handle.room_id().to_string(),
            json: handle.to_json(),
            bound_connections: handle.connection_count(),
            presence_members: state.coordinator.hub().members(&room_id),
        }),
    ))
}
