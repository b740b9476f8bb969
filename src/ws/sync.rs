use std::borrow::Cow;
use std::sync::Arc;
use axum::{
    extract::{Path, State, ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade}},
    response::Response,
};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::rooms::handle::SyncFrame;
use crate::rooms::DocumentHandle;
use crate::state::AppState;

/// Why a connection stopped receiving room updates.
#[derive(Debug, PartialEq, Eq)]
enum ForwardEnd {
    ClientGone,
    /// The connection fell behind by this many frames.
    Lagged(u64),
    RoomClosed,
}

/// Sync channel handler; the path names the room
pub async fn sync_handler(
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("New sync connection attempt for room {}", room_id);
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, state))
}

/// Sync connection without a room in its path
pub async fn sync_root_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, String::new(), state))
}

/// Bind a sync connection to its room's document and pump updates both ways
async fn handle_socket(mut socket: WebSocket, room_id: String, state: Arc<AppState>) {
    let binding = match state.coordinator.on_sync_connect(&room_id).await {
        Ok(binding) => binding,
        Err(e) => {
            warn!("Rejecting sync connection: {}", e);
            let close = Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: Cow::from(e.to_string()),
            }));
            if socket.send(close).await.is_err() {
                warn!("Failed to send close frame to rejected sync connection");
            }
            return;
        }
    };

    let connection_id = binding.connection_id;
    let handle = binding.handle().clone();

    // Subscribe before taking the snapshot so no update falls in between
    let mut frames = handle.frames();
    let snapshot = match handle.encode_state() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("Failed to encode initial state for room {}: {}", room_id, e);
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();
    if sender.send(Message::Binary(snapshot)).await.is_err() {
        error!("Failed to send initial state for room {}", room_id);
        return;
    }

    let send_room = room_id.clone();
    let mut send_task = tokio::spawn(async move {
        match forward_frames(&mut frames, connection_id, &mut sender).await {
            ForwardEnd::Lagged(missed) => {
                // The client must reconnect to get a fresh snapshot
                warn!("Sync connection {} in room {} lagged by {} frames, closing", connection_id, send_room, missed);
            }
            end => debug!("Sync connection {} stopped forwarding: {:?}", connection_id, end),
        }
    });

    let recv_handle = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if !handle_incoming(&recv_handle, connection_id, msg) {
                break;
            }
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    drop(binding);
    info!("Sync connection {} for room {} terminated", connection_id, room_id);
}

/// Send the room's updates to one connection, skipping the ones it sent itself.
async fn forward_frames<S>(
    frames: &mut broadcast::Receiver<SyncFrame>,
    connection_id: u64,
    sink: &mut S,
) -> ForwardEnd
where
    S: Sink<Message> + Unpin,
{
    loop {
        match frames.recv().await {
            Ok(frame) => {
                // Skip updates from this connection to prevent echo
                if frame.origin == Some(connection_id) {
                    continue;
                }
                if sink.send(Message::Binary(frame.bytes.to_vec())).await.is_err() {
                    return ForwardEnd::ClientGone;
                }
            }
            Err(RecvError::Lagged(missed)) => return ForwardEnd::Lagged(missed),
            Err(RecvError::Closed) => return ForwardEnd::RoomClosed,
        }
    }
}

/// Handle one frame from a sync client. Returns `false` once the client is closing.
fn handle_incoming(handle: &DocumentHandle, connection_id: u64, msg: Message) -> bool {
    match msg {
        Message::Binary(bytes) => {
            if let Err(e) = handle.apply_update(bytes, Some(connection_id)) {
                warn!("Dropping sync frame from connection {} in room {}: {}", connection_id, handle.room_id(), e);
            }
            true
        }
        Message::Close(_) => false,
        _ => true,
    }
}
