use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PayloadError;

pub type MessageId = i64;
pub type RoomId = i64;
pub type UserId = i64;

/// A chat message in the fixed shape the engine works with.
///
/// Deserialising goes through [`RawChatMessage`], which accepts the key
/// variants the servers emit and fails on a missing `id`, `roomId` or
/// `senderId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawChatMessage")]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_display_name: String,
    pub sender_avatar_url: Option<String>,
    pub origin_content: String,
    pub translated_content: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn from_value(value: serde_json::Value) -> Result<Self, PayloadError> {
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChatMessage {
    #[serde(alias = "messageId", alias = "chatId")]
    id: Option<MessageId>,
    #[serde(alias = "chatRoomId")]
    room_id: Option<RoomId>,
    sender_id: Option<UserId>,
    #[serde(alias = "senderName", alias = "nickname")]
    sender_display_name: Option<String>,
    #[serde(alias = "senderProfileImage", alias = "profileImageUrl")]
    sender_avatar_url: Option<String>,
    #[serde(alias = "content")]
    origin_content: Option<String>,
    translated_content: Option<String>,
    #[serde(alias = "createdAt")]
    sent_at: Option<RawTimestamp>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    EpochSeconds(i64),
    Text(String),
}

impl TryFrom<RawChatMessage> for ChatMessage {
    type Error = PayloadError;

    fn try_from(raw: RawChatMessage) -> Result<Self, Self::Error> {
        let sent_at = match raw.sent_at {
            Some(ts) => normalize_timestamp(ts)?,
            // Push envelopes occasionally omit it; arrival time is the best we have.
            None => Utc::now(),
        };

        Ok(ChatMessage {
            id: raw.id.ok_or(PayloadError::MissingField("id"))?,
            room_id: raw.room_id.ok_or(PayloadError::MissingField("roomId"))?,
            sender_id: raw.sender_id.ok_or(PayloadError::MissingField("senderId"))?,
            sender_display_name: raw.sender_display_name.unwrap_or_default(),
            sender_avatar_url: raw.sender_avatar_url.filter(|url| !url.is_empty()),
            origin_content: raw.origin_content.unwrap_or_default(),
            translated_content: raw.translated_content,
            sent_at,
        })
    }
}

fn normalize_timestamp(ts: RawTimestamp) -> Result<DateTime<Utc>, PayloadError> {
    match ts {
        RawTimestamp::EpochSeconds(secs) => DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| PayloadError::InvalidTimestamp(secs.to_string())),
        RawTimestamp::Text(text) => parse_timestamp(&text),
    }
}

/// Accepts RFC 3339, or a zone-less ISO local time which the servers send in UTC.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, PayloadError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(PayloadError::InvalidTimestamp(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_alternate_keys_and_epoch_seconds() {
        let msg = ChatMessage::from_value(json!({
            "messageId": 7,
            "chatRoomId": 3,
            "senderId": 42,
            "senderName": "mina",
            "content": "hello",
            "createdAt": 1_700_000_000
        }))
        .unwrap();

        assert_eq!(msg.id, 7);
        assert_eq!(msg.room_id, 3);
        assert_eq!(msg.sender_display_name, "mina");
        assert_eq!(msg.origin_content, "hello");
        assert_eq!(msg.sent_at.timestamp(), 1_700_000_000);
        assert!(msg.translated_content.is_none());
    }

    #[test]
    fn string_and_epoch_timestamps_agree() {
        let a = parse_timestamp("2023-11-14T22:13:20").unwrap();
        let b = parse_timestamp("2023-11-14T22:13:20Z").unwrap();
        let c = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(a, c);
        assert_eq!(b, c);
    }

    #[test]
    fn missing_required_fields_fail_fast() {
        let err = ChatMessage::from_value(json!({
            "id": 1,
            "senderId": 2,
            "originContent": "x"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("roomId"), "{err}");

        let err = ChatMessage::from_value(json!({ "roomId": 1, "senderId": 2 })).unwrap_err();
        assert!(err.to_string().contains("`id`"), "{err}");
    }

    #[test]
    fn rejects_garbage_timestamp() {
        let err = ChatMessage::from_value(json!({
            "id": 1, "roomId": 1, "senderId": 1, "sentAt": "yesterday"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("yesterday"));
    }

    #[test]
    fn serializes_in_canonical_shape() {
        let msg = ChatMessage::from_value(json!({
            "id": 5, "roomId": 1, "senderId": 9, "originContent": "hi",
            "sentAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["originContent"], "hi");
        assert_eq!(ChatMessage::from_value(value).unwrap(), msg);
    }
}
