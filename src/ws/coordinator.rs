use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::errors::SessionError;
use crate::models::{JoinAck, NicknameAck};
use crate::presence::{EventSink, RoomPresenceHub};
use crate::rooms::{ConnectionLease, DocumentHandle, DocumentRegistry};

/// A sync connection bound to a room's document.
///
/// Dropping it releases the connection from the room.
pub struct SyncBinding {
    pub connection_id: u64,
    lease: ConnectionLease,
}

impl SyncBinding {
    pub fn handle(&self) -> &DocumentHandle {
        self.lease.handle()
    }
}

/// Nickname given to a presence socket until it picks one.
pub fn default_nickname(socket_id: &str) -> String {
    format!("User-{}", socket_id.chars().take(5).collect::<String>())
}

/// Routes connection events of the presence and sync channels to the
/// presence hub and the document registry.
///
/// The two channels only share room ids; a presence socket and a sync
/// connection of the same client know nothing about each other.
pub struct SessionCoordinator {
    registry: DocumentRegistry,
    hub: RoomPresenceHub,
    next_connection_id: AtomicU64,
}

impl SessionCoordinator {
    pub fn new(registry: DocumentRegistry, hub: RoomPresenceHub) -> Self {
        Self {
            registry,
            hub,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &RoomPresenceHub {
        &self.hub
    }

    /// A presence socket connected. Returns the id it is tracked under.
    pub fn on_presence_connect(&self, sink: EventSink) -> String {
        let socket_id = Uuid::new_v4().simple().to_string();
        let nickname = default_nickname(&socket_id);
        info!("A user connected to the presence channel: {} ({})", socket_id, nickname);
        self.hub.connect(&socket_id, &nickname, sink);
        socket_id
    }

    pub fn on_join_room(&self, socket_id: &str, room_id: &str, ack: impl FnOnce(JoinAck)) {
        info!("Socket {} attempting to join room: {}", socket_id, room_id);
        if let Some(previous) = self.hub.room_of(socket_id) {
            debug!("Socket {} is currently in room {}", socket_id, previous);
        }
        ack(self.hub.join(socket_id, room_id));
    }

    pub fn on_set_nickname(&self, socket_id: &str, nickname: &str, ack: impl FnOnce(NicknameAck)) {
        if let Some(current) = self.hub.nickname(socket_id) {
            debug!("Socket {} renaming from {} to {}", socket_id, current, nickname);
        }
        ack(self.hub.set_nickname(socket_id, nickname));
    }

    pub fn on_cursor_change(&self, socket_id: &str, cursor: Map<String, Value>) {
        self.hub.relay_cursor(socket_id, cursor);
    }

    pub fn on_presence_disconnect(&self, socket_id: &str) {
        self.hub.disconnect(socket_id);
    }

    /// A sync connection arrived for `room_id`.
    ///
    /// An empty room id is a protocol violation and allocates nothing.
    pub async fn on_sync_connect(&self, room_id: &str) -> Result<SyncBinding, SessionError> {
        if room_id.is_empty() {
            error!("Sync connection without a room id");
            return Err(SessionError::MissingRoomId);
        }

        let handle = self.registry.get_or_create(room_id).await;
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        info!("Sync connection {} bound to room {}", connection_id, room_id);
        Ok(SyncBinding {
            connection_id,
            lease: handle.lease(),
        })
    }
}
