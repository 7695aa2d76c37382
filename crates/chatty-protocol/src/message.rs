//! Message types as the backend serializes them.
//!
//! The backend stores epoch milliseconds for timestamps and uses UUIDs for
//! both message and user identities. Field names on the wire are camelCase.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted conversation message, as returned by the REST endpoints and
/// pushed over the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message id, assigned by the server on persist.
    pub id: Uuid,

    /// Sending user.
    pub sender: Uuid,

    /// Receiving user.
    pub receiver: Uuid,

    /// Message text.
    #[serde(default)]
    pub text: String,

    /// Unix milliseconds, assigned by the server.
    pub created_at: i64,

    /// Soft-delete flag. Deleted messages still appear in history so
    /// clients can render tombstones.
    #[serde(default)]
    pub is_deleted: bool,
}

impl Message {
    /// Build a message with a fresh v4 id and the given timestamp.
    ///
    /// Used by clients to synthesize provisional entries before the server
    /// echo arrives; the echo carries the authoritative id.
    pub fn provisional(sender: Uuid, receiver: Uuid, text: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            receiver,
            text: text.into(),
            created_at: now_ms,
            is_deleted: false,
        }
    }
}

/// Body of a `SEND` frame published to the broker.
///
/// Note the field is `messageText`, not `text`: the WebSocket controller
/// and the REST controller use different DTOs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub sender: Uuid,
    pub receiver: Uuid,
    pub message_text: String,
}

/// Body of a `POST /api/messages` request (HTTP send fallback).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    pub sender: Uuid,
    pub receiver: Uuid,
    pub text: String,
}

/// Normalize an inbound frame body into a list of messages.
///
/// The broker pushes a JSON array of messages, but a single object is also
/// accepted for robustness against older backend versions.
pub fn parse_message_payload(body: &str) -> Result<Vec<Message>, serde_json::Error> {
    match serde_json::from_str::<Vec<Message>>(body) {
        Ok(batch) => Ok(batch),
        Err(_) => serde_json::from_str::<Message>(body).map(|m| vec![m]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json(id: &str, created_at: i64) -> String {
        format!(
            r#"{{"id":"{id}","sender":"11111111-1111-1111-1111-111111111111","receiver":"22222222-2222-2222-2222-222222222222","text":"hi","createdAt":{created_at}}}"#
        )
    }

    #[test]
    fn test_message_wire_format() {
        let json = sample_json("33333333-3333-3333-3333-333333333333", 1700000000000);
        let msg: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.created_at, 1700000000000);
        assert!(!msg.is_deleted);

        let out = serde_json::to_value(&msg).unwrap();
        assert!(out.get("createdAt").is_some(), "timestamps are camelCase");
        assert!(out.get("created_at").is_none());
    }

    #[test]
    fn test_parse_payload_array_and_single() {
        let single = sample_json("33333333-3333-3333-3333-333333333333", 100);
        let parsed = parse_message_payload(&single).unwrap();
        assert_eq!(parsed.len(), 1);

        let array = format!("[{single}]");
        let parsed = parse_message_payload(&array).unwrap();
        assert_eq!(parsed.len(), 1);

        assert!(parse_message_payload("not json").is_err());
    }

    #[test]
    fn test_send_body_uses_message_text() {
        let body = SendMessageBody {
            sender: Uuid::nil(),
            receiver: Uuid::nil(),
            message_text: "hello".into(),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"messageText\":\"hello\""));
    }
}
