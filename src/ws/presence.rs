use std::sync::Arc;
use axum::{
    extract::{State, ws::{Message, WebSocket, WebSocketUpgrade}},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::models::{AckReply, ClientEvent, ClientFrame, ServerEvent};
use crate::state::AppState;
use super::coordinator::SessionCoordinator;

/// Presence channel WebSocket handler
pub async fn presence_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("New presence connection attempt");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a presence WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Everything this socket should see goes through one queue
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let socket_id = state.coordinator.on_presence_connect(tx.clone());

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize presence event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let recv_socket_id = socket_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_client_text(&recv_state.coordinator, &recv_socket_id, &text, &tx);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    state.coordinator.on_presence_disconnect(&socket_id);
    info!("Presence connection {} terminated", socket_id);
}

/// Parse and dispatch one text frame from a presence socket.
pub(crate) fn handle_client_text(
    coordinator: &SessionCoordinator,
    socket_id: &str,
    text: &str,
    reply_to: &UnboundedSender<ServerEvent>,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Failed to parse presence frame from {}: {}", socket_id, e);
            return;
        }
    };
    let (event, ack_id) = match frame.into_event() {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Ignoring presence frame from {}: {}", socket_id, e);
            return;
        }
    };

    match event {
        ClientEvent::JoinRoom(room_id) => {
            coordinator.on_join_room(socket_id, &room_id, |ack| send_ack(reply_to, ack_id, &ack));
        }
        ClientEvent::SetAppNickname(nickname) => {
            coordinator.on_set_nickname(socket_id, &nickname, |ack| send_ack(reply_to, ack_id, &ack));
        }
        ClientEvent::CursorChange(cursor) => {
            coordinator.on_cursor_change(socket_id, cursor);
        }
    }
}

fn send_ack<T: Serialize>(reply_to: &UnboundedSender<ServerEvent>, ack_id: Option<u64>, response: &T) {
    let Some(id) = ack_id else {
        return;
    };
    match serde_json::to_value(response) {
        Ok(response) => {
            if reply_to.send(ServerEvent::Ack(AckReply { id, response })).is_err() {
                debug!("Ack {} dropped, socket already closed", id);
            }
        }
        Err(e) => error!("Failed to serialize ack {}: {}", id, e),
    }
}
