use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{MessageId, RoomId, UserId};

pub const SEND_DESTINATION: &str = "/app/chat.send";
pub const DELETE_DESTINATION: &str = "/app/chat.delete";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "connect")]
    Connect { token: String },
    #[serde(rename = "subscribe")]
    Subscribe { id: String, destination: String },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { id: String },
    #[serde(rename = "send")]
    Send { destination: String, body: Value },
    #[serde(rename = "disconnect")]
    Disconnect,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        subscription: Option<String>,
        destination: String,
        body: Value,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        kind: FrameErrorKind,
        message: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrameErrorKind {
    Auth,
    #[default]
    Protocol,
}

/// The two subscriptions a room session holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// New messages addressed to the user, across every room they are in.
    UserInbox(UserId),
    /// Structural events for one room.
    RoomBroadcast(RoomId),
}

impl Topic {
    pub fn destination(&self) -> String {
        match self {
            Topic::UserInbox(user_id) => format!("/topic/user.{user_id}"),
            Topic::RoomBroadcast(room_id) => format!("/topic/room.{room_id}"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendCommand {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCommand {
    pub message_id: MessageId,
    pub sender_id: UserId,
}

/// Events on the room broadcast topic.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum RoomEvent {
    #[serde(rename = "delete")]
    Delete {
        #[serde(alias = "messageId")]
        id: MessageId,
    },
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_are_type_tagged() {
        let frame = ClientFrame::Send {
            destination: SEND_DESTINATION.to_string(),
            body: serde_json::to_value(SendCommand { room_id: 1, sender_id: 2, content: "hi".into() })
                .unwrap(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "send");
        assert_eq!(value["body"]["roomId"], 1);
        assert_eq!(value["body"]["senderId"], 2);
    }

    #[test]
    fn error_frames_default_to_protocol() {
        let frame: ServerFrame =
            serde_json::from_value(json!({ "type": "error", "message": "bad frame" })).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Error { kind: FrameErrorKind::Protocol, message: "bad frame".into() }
        );

        let frame: ServerFrame =
            serde_json::from_value(json!({ "type": "error", "kind": "auth", "message": "expired" }))
                .unwrap();
        assert!(matches!(frame, ServerFrame::Error { kind: FrameErrorKind::Auth, .. }));
    }

    #[test]
    fn room_events_tolerate_unknown_types() {
        let event: RoomEvent = serde_json::from_value(json!({ "type": "delete", "messageId": 9 })).unwrap();
        assert_eq!(event, RoomEvent::Delete { id: 9 });

        let event: RoomEvent = serde_json::from_value(json!({ "type": "pin", "id": 9 })).unwrap();
        assert_eq!(event, RoomEvent::Unknown);
    }

    #[test]
    fn topics_are_scoped() {
        assert_eq!(Topic::UserInbox(5).destination(), "/topic/user.5");
        assert_eq!(Topic::RoomBroadcast(8).destination(), "/topic/room.8");
    }
}
