//! Envelope protocol.
//!
//! Every frame on the wire, in either direction, is a JSON object of the form
//! `{"type": <string>, "payload": <type-specific>}`. The typed payload structs
//! below describe the shapes the relay produces and consumes.
//!
//! ```text
//! client -> relay   auth, message, message_status, ping
//! relay  -> client  message, status_update, conversation_update, ack, pong, error
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;
use crate::types::{ElGamalContent, Identity, RecipientStatus};

/// Envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Auth,
    Message,
    MessageStatus,
    StatusUpdate,
    Ack,
    ConversationUpdate,
    Ping,
    Pong,
    Error,
}

impl EnvelopeType {
    /// Wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Message => "message",
            Self::MessageStatus => "message_status",
            Self::StatusUpdate => "status_update",
            Self::Ack => "ack",
            Self::ConversationUpdate => "conversation_update",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
        }
    }
}

/// The unit of transport and routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope from a typed payload.
    pub fn new<T: Serialize>(kind: EnvelopeType, payload: &T) -> Result<Self, RelayError> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Build an envelope with an empty object payload.
    pub fn empty(kind: EnvelopeType) -> Self {
        Self {
            kind,
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Decode an envelope from frame text.
    ///
    /// Unknown types and malformed JSON are protocol errors.
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::protocol(format!("invalid envelope: {e}")))
    }

    /// Encode the envelope as frame text.
    pub fn encode(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Encode into a shareable frame for fan-out.
    pub fn to_frame(&self) -> Result<Arc<str>, RelayError> {
        self.encode().map(Arc::from)
    }

    /// Deserialize the payload into its typed shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, RelayError> {
        T::deserialize(&self.payload).map_err(|e| {
            RelayError::protocol(format!("invalid {} payload: {e}", self.kind.as_str()))
        })
    }
}

/// `auth` in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

/// `message` in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub conversation_id: String,
    pub encrypted_contents: BTreeMap<Identity, ElGamalContent>,
}

/// `message` out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: Identity,
    pub created_at: DateTime<Utc>,
    pub encrypted_contents: BTreeMap<Identity, ElGamalContent>,
}

/// `message_status` in.
///
/// A `userId` field, if present, is ignored: the row updated is always the
/// caller's own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub message_id: String,
    pub status: RecipientStatus,
}

/// `status_update` out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub message_id: String,
    pub status: RecipientStatus,
    pub user_id: Identity,
}

/// `ack` out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub message_id: String,
    pub status: String,
}

impl Ack {
    /// Acknowledge that a message was persisted.
    pub fn received(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            status: "received".to_string(),
        }
    }
}

/// `error` out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl From<&RelayError> for ErrorPayload {
    fn from(err: &RelayError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            message_id: err.message_id().map(str::to_string),
        }
    }
}

/// A payload addressed to an ordered set of recipients.
///
/// The envelope is serialized once when the request is built, so the hub
/// only ever copies a shared pointer per recipient.
#[derive(Debug, Clone)]
pub struct FanoutRequest {
    pub kind: EnvelopeType,
    pub frame: Arc<str>,
    pub recipients: Vec<Identity>,
}

impl FanoutRequest {
    /// Build a request, dropping duplicate recipients while keeping order.
    pub fn new(
        envelope: &Envelope,
        recipients: impl IntoIterator<Item = Identity>,
    ) -> Result<Self, RelayError> {
        let mut unique: Vec<Identity> = Vec::new();
        for recipient in recipients {
            if !unique.contains(&recipient) {
                unique.push(recipient);
            }
        }
        Ok(Self {
            kind: envelope.kind,
            frame: envelope.to_frame()?,
            recipients: unique,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content(n: &str) -> ElGamalContent {
        ElGamalContent {
            a: n.to_string(),
            b: "17".to_string(),
            p: "23".to_string(),
        }
    }

    #[test]
    fn test_decode_incoming_message() {
        let text = r#"{"type":"message","payload":{"conversationId":"c1","encryptedContents":{"alice":{"a":"1","b":"2","p":"3"}}}}"#;
        let envelope = Envelope::decode(text).unwrap();
        assert_eq!(envelope.kind, EnvelopeType::Message);

        let msg: IncomingMessage = envelope.payload_as().unwrap();
        assert_eq!(msg.conversation_id, "c1");
        assert_eq!(msg.encrypted_contents[&Identity::new("alice")].p, "3");
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = Envelope::decode(r#"{"type":"typing","payload":{}}"#).unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        let err = Envelope::decode("{not json").unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let envelope = Envelope::decode(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(envelope.kind, EnvelopeType::Ping);
        assert!(envelope.payload.is_null());
    }

    #[test]
    fn test_payload_shape_mismatch() {
        let envelope = Envelope::decode(r#"{"type":"message_status","payload":{"messageId":"m1","status":"LOST"}}"#).unwrap();
        let err = envelope.payload_as::<StatusChange>().unwrap_err();
        assert!(err.to_string().contains("message_status"));
    }

    #[test]
    fn test_status_change_ignores_user_id() {
        let envelope = Envelope::decode(
            r#"{"type":"message_status","payload":{"messageId":"m1","status":"READ","userId":"mallory"}}"#,
        )
        .unwrap();
        let change: StatusChange = envelope.payload_as().unwrap();
        assert_eq!(change.status, RecipientStatus::Read);
    }

    #[test]
    fn test_delivered_message_wire_shape() {
        let created_at = DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut contents = BTreeMap::new();
        contents.insert(Identity::new("bob"), content("5"));
        let delivered = DeliveredMessage {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_id: Identity::new("alice"),
            created_at,
            encrypted_contents: contents,
        };
        let envelope = Envelope::new(EnvelopeType::Message, &delivered).unwrap();
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "message");
        assert_eq!(value["payload"]["senderId"], "alice");
        assert_eq!(value["payload"]["conversationId"], "c1");
        assert_eq!(value["payload"]["createdAt"], "2025-03-01T12:00:00Z");
        assert_eq!(value["payload"]["encryptedContents"]["bob"]["a"], "5");
    }

    #[test]
    fn test_ack_and_error_shapes() {
        let ack = Envelope::new(EnvelopeType::Ack, &Ack::received("m1")).unwrap();
        assert_eq!(ack.payload, json!({"messageId": "m1", "status": "received"}));

        let err = RelayError::ConversationNotFound("c9".into());
        let payload = ErrorPayload::from(&err);
        let envelope = Envelope::new(EnvelopeType::Error, &payload).unwrap();
        assert_eq!(envelope.payload["code"], "conversation_not_found");
        assert!(envelope.payload.get("messageId").is_none());
    }

    #[test]
    fn test_conversation_update_is_empty_object() {
        let envelope = Envelope::empty(EnvelopeType::ConversationUpdate);
        assert_eq!(
            envelope.encode().unwrap(),
            r#"{"type":"conversation_update","payload":{}}"#
        );
    }

    #[test]
    fn test_fanout_request_dedupes_in_order() {
        let envelope = Envelope::empty(EnvelopeType::ConversationUpdate);
        let request = FanoutRequest::new(
            &envelope,
            ["bob", "alice", "bob", "carol"].into_iter().map(Identity::from),
        )
        .unwrap();
        let names: Vec<&str> = request.recipients.iter().map(Identity::as_str).collect();
        assert_eq!(names, vec!["bob", "alice", "carol"]);
        assert_eq!(request.kind, EnvelopeType::ConversationUpdate);
    }
}
