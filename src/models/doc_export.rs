use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// JSON view of an active room's document
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoomExportResponse {
    pub room_id: String,
    pub json: serde_json::value::Value,
    pub bound_connections: usize,
    pub presence_members: Vec<String>,
}
