use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::models::{
    AckStatus, CursorUpdate, JoinAck, NicknameAck, NicknameChanged, PresenceNotice, ServerEvent,
};

/// Outbound queue of one presence socket.
pub type EventSink = UnboundedSender<ServerEvent>;

struct PresenceEntry {
    nickname: String,
    current_room: Option<String>,
    sink: EventSink,
}

#[derive(Default)]
struct PresenceState {
    sockets: HashMap<String, PresenceEntry>,
    rooms: HashMap<String, HashSet<String>>,
}

impl PresenceState {
    /// Send `event` to every member of `room_id` except `skip`.
    ///
    /// Sinks of sockets that already went away are skipped silently.
    fn broadcast(&self, room_id: &str, skip: Option<&str>, event: &ServerEvent) {
        let Some(members) = self.rooms.get(room_id) else {
            return;
        };
        for member in members {
            if Some(member.as_str()) == skip {
                continue;
            }
            if let Some(entry) = self.sockets.get(member) {
                if entry.sink.send(event.clone()).is_err() {
                    debug!("Dropped presence event for closed socket {}", member);
                }
            }
        }
    }

    fn remove_member(&mut self, room_id: &str, socket_id: &str) {
        if let Some(members) = self.rooms.get_mut(room_id) {
            members.remove(socket_id);
            if members.is_empty() {
                self.rooms.remove(room_id);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PresenceStats {
    pub sockets: usize,
    pub rooms: usize,
}

fn left_notice(socket_id: &str, nickname: &str, room_id: &str) -> ServerEvent {
    ServerEvent::UserLeftAppRoom(PresenceNotice {
        user_id: socket_id.to_string(),
        nickname: nickname.to_string(),
        room_id: room_id.to_string(),
        message: format!("{} left the room.", nickname),
    })
}

/// Room membership and nicknames of presence sockets.
///
/// Every operation updates the bookkeeping and emits its broadcasts under one
/// lock, so events for a room reach members in the order they were handled.
#[derive(Default)]
pub struct RoomPresenceHub {
    state: Mutex<PresenceState>,
}

impl RoomPresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a newly connected socket.
    pub fn connect(&self, socket_id: &str, nickname: &str, sink: EventSink) {
        let previous = self.state().sockets.insert(
            socket_id.to_string(),
            PresenceEntry {
                nickname: nickname.to_string(),
                current_room: None,
                sink,
            },
        );
        if previous.is_some() {
            warn!("Presence socket {} connected twice, replacing its entry", socket_id);
        }
    }

    /// Move a socket into `room_id`, leaving its previous room.
    pub fn join(&self, socket_id: &str, room_id: &str) -> JoinAck {
        if room_id.is_empty() {
            return JoinAck {
                status: AckStatus::Error,
                room_id: String::new(),
                message: "A room id is required".to_string(),
            };
        }

        let mut state = self.state();
        let (nickname, previous_room) = match state.sockets.get(socket_id) {
            Some(entry) => (entry.nickname.clone(), entry.current_room.clone()),
            None => {
                warn!("Unknown socket {} tried to join room {}", socket_id, room_id);
                return JoinAck {
                    status: AckStatus::Error,
                    room_id: room_id.to_string(),
                    message: "Unknown connection".to_string(),
                };
            }
        };

        if previous_room.as_deref() != Some(room_id) {
            if let Some(previous) = &previous_room {
                state.remove_member(previous, socket_id);
                state.broadcast(previous, None, &left_notice(socket_id, &nickname, previous));
                info!("Socket {} left room {}", socket_id, previous);
            }

            state
                .rooms
                .entry(room_id.to_string())
                .or_default()
                .insert(socket_id.to_string());
            if let Some(entry) = state.sockets.get_mut(socket_id) {
                entry.current_room = Some(room_id.to_string());
            }
        } else {
            debug!("Socket {} is already in room {}", socket_id, room_id);
        }

        // Peers hear about a rejoin too; membership is unchanged in that case
        let joined = ServerEvent::UserJoinedAppRoom(PresenceNotice {
            user_id: socket_id.to_string(),
            nickname: nickname.clone(),
            room_id: room_id.to_string(),
            message: format!("{} joined the room.", nickname),
        });
        state.broadcast(room_id, Some(socket_id), &joined);
        info!("Socket {} ({}) joined room {}", socket_id, nickname, room_id);

        JoinAck {
            status: AckStatus::Ok,
            room_id: room_id.to_string(),
            message: format!("Successfully joined room: {}", room_id),
        }
    }

    /// Rename a socket and tell its room, the renamer included.
    pub fn set_nickname(&self, socket_id: &str, nickname: &str) -> NicknameAck {
        let mut state = self.state();
        let Some(entry) = state.sockets.get_mut(socket_id) else {
            warn!("Unknown socket {} tried to set nickname", socket_id);
            return NicknameAck {
                status: AckStatus::Error,
                nickname: nickname.to_string(),
            };
        };
        let old_nickname = std::mem::replace(&mut entry.nickname, nickname.to_string());
        let room = entry.current_room.clone();
        info!("Socket {} set nickname to {}", socket_id, nickname);

        if let Some(room_id) = room {
            let changed = ServerEvent::UserNicknameChanged(NicknameChanged {
                user_id: socket_id.to_string(),
                old_nickname,
                new_nickname: nickname.to_string(),
                room_id: room_id.clone(),
            });
            state.broadcast(&room_id, None, &changed);
        }

        NicknameAck {
            status: AckStatus::Ok,
            nickname: nickname.to_string(),
        }
    }

    /// Forward a cursor payload to the other members of the sender's room.
    ///
    /// Returns the number of sockets it was sent to. A sender outside any room
    /// is logged and ignored.
    pub fn relay_cursor(&self, socket_id: &str, mut cursor: Map<String, Value>) -> usize {
        let state = self.state();
        let (nickname, room_id) = match state.sockets.get(socket_id) {
            Some(PresenceEntry {
                nickname,
                current_room: Some(room_id),
                ..
            }) => (nickname.clone(), room_id.clone()),
            _ => {
                warn!("Socket {} sent 'cursorChange' but is not in a known room", socket_id);
                return 0;
            }
        };

        // The sender's identity is not up to the payload
        cursor.remove("userId");
        cursor.remove("nickname");
        let update = ServerEvent::CursorUpdate(CursorUpdate {
            user_id: socket_id.to_string(),
            nickname,
            cursor,
        });
        state.broadcast(&room_id, Some(socket_id), &update);
        state.rooms.get(&room_id).map_or(0, |m| m.len().saturating_sub(1))
    }

    /// Forget a socket, telling its room it left.
    pub fn disconnect(&self, socket_id: &str) {
        let mut state = self.state();
        let Some(entry) = state.sockets.remove(socket_id) else {
            return;
        };
        match entry.current_room {
            Some(room_id) => {
                state.remove_member(&room_id, socket_id);
                state.broadcast(&room_id, None, &left_notice(socket_id, &entry.nickname, &room_id));
                info!("Socket {} ({}) disconnected from room {}", socket_id, entry.nickname, room_id);
            }
            None => {
                info!("Socket {} ({}) disconnected (was not in a room)", socket_id, entry.nickname);
            }
        }
    }

    pub fn members(&self, room_id: &str) -> Vec<String> {
        self.state()
            .rooms
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_of(&self, socket_id: &str) -> Option<String> {
        self.state().sockets.get(socket_id).and_then(|e| e.current_room.clone())
    }

    pub fn nickname(&self, socket_id: &str) -> Option<String> {
        self.state().sockets.get(socket_id).map(|e| e.nickname.clone())
    }

    pub fn stats(&self) -> PresenceStats {
        let state = self.state();
        PresenceStats {
            sockets: state.sockets.len(),
            rooms: state.rooms.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn connect(hub: &RoomPresenceHub, id: &str) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = unbounded_channel();
        hub.connect(id, &format!("User-{}", id), tx);
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn join_notifies_existing_members_but_not_self() {
        let hub = RoomPresenceHub::new();
        let mut s1 = connect(&hub, "s1");
        let mut s2 = connect(&hub, "s2");

        hub.join("s1", "r1");
        let ack = hub.join("s2", "r1");

        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.room_id, "r1");
        assert!(drain(&mut s2).is_empty());
        match drain(&mut s1).as_slice() {
            [ServerEvent::UserJoinedAppRoom(notice)] => {
                assert_eq!(notice.user_id, "s2");
                assert_eq!(notice.nickname, "User-s2");
                assert_eq!(notice.room_id, "r1");
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn moving_rooms_emits_one_left_and_one_joined() {
        let hub = RoomPresenceHub::new();
        let mut a_peer = connect(&hub, "a");
        let mut b_peer = connect(&hub, "b");
        let mut mover = connect(&hub, "s");
        hub.join("a", "A");
        hub.join("b", "B");
        hub.join("s", "A");
        drain(&mut a_peer);

        hub.join("s", "B");

        let a_events = drain(&mut a_peer);
        assert_eq!(a_events.len(), 1);
        assert!(matches!(&a_events[0], ServerEvent::UserLeftAppRoom(n) if n.user_id == "s" && n.room_id == "A"));

        let b_events = drain(&mut b_peer);
        assert_eq!(b_events.len(), 1);
        assert!(matches!(&b_events[0], ServerEvent::UserJoinedAppRoom(n) if n.user_id == "s" && n.room_id == "B"));

        assert!(drain(&mut mover).is_empty());
        assert_eq!(hub.room_of("s").as_deref(), Some("B"));
        assert_eq!(hub.members("A"), vec!["a".to_string()]);
        let mut b_members = hub.members("B");
        b_members.sort();
        assert_eq!(b_members, vec!["b".to_string(), "s".to_string()]);
    }

    #[test]
    fn rejoining_the_same_room_announces_again_without_moving() {
        let hub = RoomPresenceHub::new();
        let mut s1 = connect(&hub, "s1");
        let mut s2 = connect(&hub, "s2");
        hub.join("s1", "r1");
        hub.join("s2", "r1");
        drain(&mut s1);

        let ack = hub.join("s2", "r1");
        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(
            drain(&mut s1),
            vec![ServerEvent::UserJoinedAppRoom(PresenceNotice {
                user_id: "s2".into(),
                nickname: "User-s2".into(),
                room_id: "r1".into(),
                message: "User-s2 joined the room.".into(),
            })]
        );
        // No "left" for the room it never left, and nothing back to itself
        assert!(drain(&mut s2).is_empty());
        assert_eq!(hub.members("r1").len(), 2);
        assert_eq!(hub.room_of("s2").as_deref(), Some("r1"));
    }

    #[test]
    fn join_rejects_empty_room_and_unknown_socket() {
        let hub = RoomPresenceHub::new();
        let _s1 = connect(&hub, "s1");

        assert_eq!(hub.join("s1", "").status, AckStatus::Error);
        assert_eq!(hub.room_of("s1"), None);
        assert_eq!(hub.join("ghost", "r1").status, AckStatus::Error);
        assert!(hub.members("r1").is_empty());
    }

    #[test]
    fn rename_reaches_whole_room_including_renamer() {
        let hub = RoomPresenceHub::new();
        let mut s1 = connect(&hub, "s1");
        let mut s2 = connect(&hub, "s2");
        let mut outsider = connect(&hub, "s3");
        hub.join("s1", "r1");
        hub.join("s2", "r1");
        hub.join("s3", "other");
        drain(&mut s1);

        let ack = hub.set_nickname("s1", "Ada");
        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.nickname, "Ada");

        let expected = ServerEvent::UserNicknameChanged(NicknameChanged {
            user_id: "s1".into(),
            old_nickname: "User-s1".into(),
            new_nickname: "Ada".into(),
            room_id: "r1".into(),
        });
        assert_eq!(drain(&mut s1), vec![expected.clone()]);
        assert_eq!(drain(&mut s2), vec![expected]);
        assert!(drain(&mut outsider).is_empty());
        assert_eq!(hub.nickname("s1").as_deref(), Some("Ada"));
    }

    #[test]
    fn rename_outside_a_room_only_updates_nickname() {
        let hub = RoomPresenceHub::new();
        let mut s1 = connect(&hub, "s1");
        assert_eq!(hub.set_nickname("s1", "Ada").status, AckStatus::Ok);
        assert!(drain(&mut s1).is_empty());
        assert_eq!(hub.nickname("s1").as_deref(), Some("Ada"));
    }

    #[test]
    fn nickname_is_stored_exactly_as_given() {
        let hub = RoomPresenceHub::new();
        let _s1 = connect(&hub, "s1");

        let ack = hub.set_nickname("s1", "  Ada  ");
        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.nickname, "  Ada  ");
        assert_eq!(hub.nickname("s1").as_deref(), Some("  Ada  "));

        assert_eq!(hub.set_nickname("s1", "").status, AckStatus::Ok);
        assert_eq!(hub.nickname("s1").as_deref(), Some(""));
    }

    #[test]
    fn cursor_goes_to_room_peers_only() {
        let hub = RoomPresenceHub::new();
        let mut s1 = connect(&hub, "s1");
        let mut s2 = connect(&hub, "s2");
        let mut other_room = connect(&hub, "s3");
        hub.join("s1", "r1");
        hub.join("s2", "r1");
        hub.join("s3", "r2");
        drain(&mut s1);

        let payload = json!({"position": 5, "userId": "spoofed"}).as_object().unwrap().clone();
        assert_eq!(hub.relay_cursor("s1", payload), 1);

        assert!(drain(&mut s1).is_empty());
        assert!(drain(&mut other_room).is_empty());
        match drain(&mut s2).as_slice() {
            [ServerEvent::CursorUpdate(update)] => {
                assert_eq!(update.user_id, "s1");
                assert_eq!(update.nickname, "User-s1");
                assert_eq!(update.cursor.get("position"), Some(&json!(5)));
                assert!(update.cursor.get("userId").is_none());
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn cursor_from_roomless_socket_is_dropped() {
        let hub = RoomPresenceHub::new();
        let mut s1 = connect(&hub, "s1");
        let mut s2 = connect(&hub, "s2");
        hub.join("s2", "r1");

        assert_eq!(hub.relay_cursor("s1", Map::new()), 0);
        assert_eq!(hub.relay_cursor("nobody", Map::new()), 0);
        assert!(drain(&mut s1).is_empty());
        assert!(drain(&mut s2).is_empty());
    }

    #[test]
    fn disconnect_tells_remaining_members_once() {
        let hub = RoomPresenceHub::new();
        let mut s1 = connect(&hub, "s1");
        let s2 = connect(&hub, "s2");
        hub.join("s1", "r2");
        hub.join("s2", "r2");
        drain(&mut s1);

        hub.set_nickname("s2", "Bob");
        drain(&mut s1);
        drop(s2);
        hub.disconnect("s2");
        hub.disconnect("s2");

        match drain(&mut s1).as_slice() {
            [ServerEvent::UserLeftAppRoom(notice)] => {
                assert_eq!(notice.user_id, "s2");
                assert_eq!(notice.nickname, "Bob");
                assert_eq!(notice.room_id, "r2");
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(hub.members("r2"), vec!["s1".to_string()]);
        assert_eq!(hub.stats().sockets, 1);
    }

    #[test]
    fn empty_rooms_are_dropped() {
        let hub = RoomPresenceHub::new();
        let _s1 = connect(&hub, "s1");
        hub.join("s1", "r1");
        hub.join("s1", "r2");
        assert_eq!(hub.stats().rooms, 1);
        hub.disconnect("s1");
        assert_eq!(hub.stats().rooms, 0);
    }
}
