//! JSON frames exchanged over the gateway WebSocket. Every frame is an object
//! tagged by its `"type"` field.

use crate::domain::message::{Message, MessageKind, OutboundMessage, Target, empty_object};
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Send(SendPayload),
    Sync {
        #[serde(default)]
        last_seen_id: Option<Uuid>,
    },
    Edit(EditPayload),
    Delete {
        message_id: Uuid,
    },
    Read {
        message_id: Uuid,
    },
    Ack {
        message_ids: Vec<Uuid>,
    },
    Ping,
}

/// Body of an inbound send, shared by the gateway and `POST /v1/messages`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SendPayload {
    #[serde(default)]
    pub client_message_id: Option<Uuid>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub receiver_id: Option<Uuid>,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub message_type: MessageKind,
    pub content: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub plaintext: Option<String>,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub mentions: Vec<Uuid>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl SendPayload {
    /// Picks the delivery target. A conversation id wins over a receiver id; a
    /// group id cannot be combined with either.
    ///
    /// # Errors
    /// Returns `AppError::BadRequest` if no recipient is given or the recipients conflict.
    pub fn into_outbound(self) -> Result<OutboundMessage, AppError> {
        let target = match (self.group_id, self.conversation_id, self.receiver_id) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(AppError::BadRequest("group_id cannot be combined with a direct recipient".into()));
            }
            (Some(group_id), None, None) => Target::Group(group_id),
            (None, Some(conversation_id), _) => Target::Resolved(conversation_id),
            (None, None, Some(receiver_id)) => Target::NeedsResolution(receiver_id),
            (None, None, None) => return Err(AppError::BadRequest("missing recipient".into())),
        };

        Ok(OutboundMessage {
            client_message_id: self.client_message_id,
            target,
            kind: self.message_type,
            content: self.content,
            nonce: self.nonce,
            plaintext: self.plaintext,
            reply_to: self.reply_to,
            mentions: self.mentions,
            metadata: self.metadata.unwrap_or_else(empty_object),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditPayload {
    pub message_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub plaintext: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub messages: Vec<Message>,
    pub count: usize,
    /// More messages remain past the cap; the client should sync again from the last one.
    pub truncated: bool,
}

impl SyncBatch {
    #[must_use]
    pub fn new(messages: Vec<Message>, truncated: bool) -> Self {
        let count = messages.len();
        Self { messages, count, truncated }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated {
        message: Message,
    },
    MessageUpdated {
        message: Message,
    },
    SyncResult(SyncBatch),
    SyncFailed {
        reason: String,
    },
    RateLimited {
        retry_after_secs: u64,
        limit: u32,
        #[serde(default)]
        client_message_id: Option<Uuid>,
    },
    Error {
        code: String,
        message: String,
        #[serde(default)]
        client_message_id: Option<Uuid>,
    },
    ResyncRequired,
    Pong,
}

impl ServerEvent {
    /// Maps a failed request onto the frame the requesting session receives.
    #[must_use]
    pub fn from_error(err: &AppError, client_message_id: Option<Uuid>) -> Self {
        match err {
            AppError::RateLimited { retry_after_secs, limit } => {
                Self::RateLimited { retry_after_secs: *retry_after_secs, limit: *limit, client_message_id }
            }
            AppError::SyncFailed => Self::SyncFailed { reason: err.public_message() },
            other => {
                Self::Error { code: other.code().to_string(), message: other.public_message(), client_message_id }
            }
        }
    }

    #[must_use]
    pub const fn message(&self) -> Option<&Message> {
        match self {
            Self::MessageCreated { message } | Self::MessageUpdated { message } => Some(message),
            _ => None,
        }
    }
}
