use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw frame received on the presence channel:
/// `{"event": "...", "data": ..., "ack": 1}`
#[derive(Deserialize, Debug)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    /// Present when the client expects an acknowledgment.
    #[serde(default)]
    pub ack: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    JoinRoom(String),
    SetAppNickname(String),
    CursorChange(Map<String, Value>),
}

impl ClientFrame {
    pub fn into_event(self) -> Result<(ClientEvent, Option<u64>), String> {
        let event = match self.event.as_str() {
            "joinRoom" => ClientEvent::JoinRoom(
                serde_json::from_value(self.data).map_err(|e| format!("invalid joinRoom payload: {}", e))?,
            ),
            "setAppNickname" => ClientEvent::SetAppNickname(
                serde_json::from_value(self.data).map_err(|e| format!("invalid setAppNickname payload: {}", e))?,
            ),
            "cursorChange" => ClientEvent::CursorChange(match self.data {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => return Err(format!("invalid cursorChange payload: {}", other)),
            }),
            other => return Err(format!("unknown event '{}'", other)),
        };
        Ok((event, self.ack))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinAck {
    pub status: AckStatus,
    pub room_id: String,
    pub message: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NicknameAck {
    pub status: AckStatus,
    pub nickname: String,
}

/// Somebody entered or left a room.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub user_id: String,
    pub nickname: String,
    pub room_id: String,
    pub message: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NicknameChanged {
    pub user_id: String,
    pub old_nickname: String,
    pub new_nickname: String,
    pub room_id: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdate {
    pub user_id: String,
    pub nickname: String,
    #[serde(flatten)]
    pub cursor: Map<String, Value>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AckReply {
    pub id: u64,
    pub response: Value,
}

/// Frames pushed to presence sockets.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    UserJoinedAppRoom(PresenceNotice),
    UserLeftAppRoom(PresenceNotice),
    UserNicknameChanged(NicknameChanged),
    CursorUpdate(CursorUpdate),
    Ack(AckReply),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_join_with_ack_id() {
        let frame: ClientFrame = serde_json::from_str(r#"{"event":"joinRoom","data":"r1","ack":4}"#).unwrap();
        let (event, ack) = frame.into_event().unwrap();
        assert_eq!(event, ClientEvent::JoinRoom("r1".into()));
        assert_eq!(ack, Some(4));
    }

    #[test]
    fn cursor_change_keeps_arbitrary_fields() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"event":"cursorChange","data":{"position":12,"selection":[1,3]}}"#).unwrap();
        let (event, ack) = frame.into_event().unwrap();
        assert_eq!(ack, None);
        match event {
            ClientEvent::CursorChange(map) => {
                assert_eq!(map.get("position"), Some(&json!(12)));
                assert_eq!(map.get("selection"), Some(&json!([1, 3])));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_events_and_bad_payloads() {
        let unknown: ClientFrame = serde_json::from_str(r#"{"event":"dance","data":1}"#).unwrap();
        assert!(unknown.into_event().is_err());

        let bad: ClientFrame = serde_json::from_str(r#"{"event":"joinRoom","data":{"x":1}}"#).unwrap();
        assert!(bad.into_event().is_err());
    }

    #[test]
    fn server_events_use_event_and_data_envelope() {
        let event = ServerEvent::UserNicknameChanged(NicknameChanged {
            user_id: "s1".into(),
            old_nickname: "User-s1".into(),
            new_nickname: "Ada".into(),
            room_id: "r1".into(),
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "userNicknameChanged",
                "data": {"userId": "s1", "oldNickname": "User-s1", "newNickname": "Ada", "roomId": "r1"}
            })
        );

        let cursor = ServerEvent::CursorUpdate(CursorUpdate {
            user_id: "s2".into(),
            nickname: "Bob".into(),
            cursor: json!({"position": 3}).as_object().unwrap().clone(),
        });
        assert_eq!(
            serde_json::to_value(&cursor).unwrap(),
            json!({"event": "cursorUpdate", "data": {"userId": "s2", "nickname": "Bob", "position": 3}})
        );
    }
}
