// letschat-protocol: wire types and serialization for the chat core.
//
// All WebSocket frames use a top-level `kind` field for discriminated
// deserialization, the same convention the HTTP error envelope and the
// chat payload itself follow.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Message operations
// ---------------------------------------------------------------------------

/// What a `Message` frame represents.
///
/// `Local` never appears on the wire — see [`Operation::to_wire_i8`]. It
/// marks a message that SendPipeline has already applied locally, so
/// RecvDispatcher skips reprocessing it when it arrives back on the shared
/// receive broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    UserOnline,
    UserOffline,
    UserTyping,
    #[serde(skip)]
    Local,
}

impl Operation {
    /// The smallest signed-8-bit value, reserved to mean "already handled
    /// locally, do not reprocess".
    pub const LOCAL_SENTINEL: i8 = i8::MIN;

    /// Encode for transports that still carry the historical `i8` sentinel
    /// convention. `Local` must never actually be sent; this exists only so
    /// that a `Local`-marked message constructed accidentally doesn't
    /// silently serialize as `Create`.
    pub fn to_wire_i8(self) -> Option<i8> {
        match self {
            Operation::Create => Some(0),
            Operation::Update => Some(1),
            Operation::Delete => Some(2),
            Operation::UserOnline => Some(3),
            Operation::UserOffline => Some(4),
            Operation::UserTyping => Some(5),
            Operation::Local => None,
        }
    }
}

/// Client-local delivery confirmation state. Never transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Confirmation {
    #[default]
    None,
    DeliveredConfirmed,
    ReadConfirmed,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// The wire representation of a chat message.
///
/// `Confirmation` and `Version` are client-local-only fields
/// and are intentionally absent from this type — they live on each
/// service's local row type instead (`letschat_server::repo::messages`,
/// `letschat_client::db`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: uuid::Uuid,
    #[serde(rename = "senderID")]
    pub sender_id: uuid::Uuid,
    #[serde(rename = "receiverID")]
    pub receiver_id: uuid::Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "sentAt", default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "deliveredAt", default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "readAt", default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<chrono::DateTime<chrono::Utc>>,
    pub operation: Operation,
}

/// Max body length, bytes.
pub const MAX_BODY_BYTES: usize = 5120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageValidationError(pub Vec<(String, String)>);

impl Message {
    /// Validate the per-operation invariants:
    /// body required iff Create; Update carries no body and at least one
    /// of deliveredAt/readAt; Delete requires only id; sentAt <= deliveredAt
    /// <= readAt when all present.
    pub fn validate(&self) -> Result<(), MessageValidationError> {
        let mut errors = Vec::new();
        match self.operation {
            Operation::Create => {
                match &self.body {
                    None => errors.push(("body".to_owned(), "required for create".to_owned())),
                    Some(b) if b.len() > MAX_BODY_BYTES => errors.push((
                        "body".to_owned(),
                        format!("must be at most {MAX_BODY_BYTES} bytes"),
                    )),
                    Some(_) => {}
                }
                if self.sent_at.is_none() {
                    errors.push(("sentAt".to_owned(), "required for create".to_owned()));
                }
            }
            Operation::Update => {
                if self.body.is_some() {
                    errors.push(("body".to_owned(), "must be absent for update".to_owned()));
                }
                if self.delivered_at.is_none() && self.read_at.is_none() {
                    errors.push((
                        "deliveredAt".to_owned(),
                        "at least one of deliveredAt/readAt required for update".to_owned(),
                    ));
                }
            }
            Operation::Delete | Operation::UserOnline | Operation::UserOffline
            | Operation::UserTyping | Operation::Local => {}
        }
        if let (Some(sent), Some(delivered)) = (self.sent_at, self.delivered_at) {
            if sent > delivered {
                errors.push(("sentAt".to_owned(), "must not be after deliveredAt".to_owned()));
            }
        }
        if let (Some(delivered), Some(read)) = (self.delivered_at, self.read_at) {
            if delivered > read {
                errors.push((
                    "deliveredAt".to_owned(),
                    "must not be after readAt".to_owned(),
                ));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MessageValidationError(errors))
        }
    }
}

// ---------------------------------------------------------------------------
// Presence / heartbeat / error control frames
// ---------------------------------------------------------------------------

/// Server -> client heartbeat, sent on a fixed interval (10s).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub session_id: String,
}

/// Frozen error codes for `ErrorMessage.code`.
pub mod error_codes {
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const VALIDATION: &str = "VALIDATION";
    pub const EDIT_CONFLICT: &str = "EDIT_CONFLICT";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// All WebSocket frame kinds exchanged on `/ws`.
///
/// ```json
/// { "kind": "message", "id": "...", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum WsFrame {
    Message(Message),
    Heartbeat(Heartbeat),
    Error(ErrorMessage),
}

// ---------------------------------------------------------------------------
// HTTP surface DTOs (a minimal registration/auth stand-in, see DESIGN.md)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: uuid::Uuid,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_online: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterUserRequest {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationRequest {
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationResponse {
    pub token: String,
    pub expiry: chrono::DateTime<chrono::Utc>,
}

/// Pagination metadata returned alongside a page of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
    pub page: u32,
    pub page_size: u32,
    pub first_page: u32,
    pub last_page: u32,
    pub total_records: u64,
}

/// Frozen HTTP error envelope used by all non-2xx responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn base_msg(op: Operation) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            body: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            operation: op,
        }
    }

    #[test]
    fn create_requires_body_and_sent_at() {
        let msg = base_msg(Operation::Create);
        let err = msg.validate().unwrap_err();
        assert!(err.0.iter().any(|(f, _)| f == "body"));
        assert!(err.0.iter().any(|(f, _)| f == "sentAt"));
    }

    #[test]
    fn create_with_body_and_sent_at_is_valid() {
        let mut msg = base_msg(Operation::Create);
        msg.body = Some("hi".to_owned());
        msg.sent_at = Some(chrono::Utc::now());
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn create_rejects_oversized_body() {
        let mut msg = base_msg(Operation::Create);
        msg.body = Some("x".repeat(MAX_BODY_BYTES + 1));
        msg.sent_at = Some(chrono::Utc::now());
        let err = msg.validate().unwrap_err();
        assert!(err.0.iter().any(|(f, _)| f == "body"));
    }

    #[test]
    fn update_rejects_body_and_requires_delivered_or_read() {
        let mut msg = base_msg(Operation::Update);
        msg.body = Some("no".to_owned());
        let err = msg.validate().unwrap_err();
        assert!(err.0.iter().any(|(f, _)| f == "body"));
        assert!(err.0.iter().any(|(f, _)| f == "deliveredAt"));
    }

    #[test]
    fn update_with_delivered_at_only_is_valid() {
        let mut msg = base_msg(Operation::Update);
        msg.delivered_at = Some(chrono::Utc::now());
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn delete_requires_nothing_else() {
        let msg = base_msg(Operation::Delete);
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn sent_at_after_delivered_at_is_invalid() {
        let mut msg = base_msg(Operation::Update);
        let now = chrono::Utc::now();
        msg.sent_at = Some(now + chrono::Duration::seconds(5));
        msg.delivered_at = Some(now);
        let err = msg.validate().unwrap_err();
        assert!(err.0.iter().any(|(f, _)| f == "sentAt"));
    }

    #[test]
    fn operation_local_has_no_wire_encoding() {
        assert_eq!(Operation::Local.to_wire_i8(), None);
        assert_eq!(Operation::Create.to_wire_i8(), Some(0));
    }

    #[test]
    fn message_roundtrips_through_json_omitting_null_optionals() {
        let mut msg = base_msg(Operation::Create);
        msg.body = Some("hello".to_owned());
        msg.sent_at = Some(chrono::Utc::now());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("deliveredAt"));
        assert!(!json.contains("readAt"));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn ws_frame_uses_kind_tag() {
        let frame = WsFrame::Heartbeat(Heartbeat {
            session_id: "s1".to_owned(),
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["kind"], "heartbeat");
        let back: WsFrame = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }
}
