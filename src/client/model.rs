use crate::domain::message::{Message, MessageKind, Transcript, Translation, empty_object};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// A message as a client holds it: either confirmed by the server or an
/// optimistic local copy shown before the server echo arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub id: Uuid,
    #[serde(default)]
    pub client_message_id: Option<Uuid>,
    pub sender_id: Uuid,
    #[serde(default)]
    pub receiver_id: Option<Uuid>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub mentions: Vec<Uuid>,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub read: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub read_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub edited_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub translation: Option<Translation>,
    #[serde(default)]
    pub transcript: Option<Transcript>,
    /// Attachment descriptors, captions and upload progress. Keys set locally
    /// survive server updates that do not mention them.
    #[serde(default = "empty_object")]
    pub metadata: Value,
    /// Server timestamp; absent until the server has confirmed the message.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    /// When this client created the entry.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub local_timestamp: Option<OffsetDateTime>,
    #[serde(default)]
    pub temporary: bool,
}

impl ClientMessage {
    /// Builds the optimistic copy of a message about to be sent. Its temporary id
    /// doubles as the `client_message_id` the server will echo back.
    #[must_use]
    pub fn optimistic(
        sender_id: Uuid,
        receiver_id: Option<Uuid>,
        kind: MessageKind,
        content: impl Into<String>,
        at: OffsetDateTime,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            client_message_id: Some(id),
            sender_id,
            receiver_id,
            conversation_id: None,
            group_id: None,
            kind,
            content: content.into(),
            nonce: None,
            reply_to: None,
            mentions: Vec::new(),
            delivered: false,
            delivered_at: None,
            read: false,
            read_at: None,
            edited: false,
            edited_at: None,
            deleted: false,
            translation: None,
            transcript: None,
            metadata: empty_object(),
            timestamp: None,
            local_timestamp: Some(at),
            temporary: true,
        }
    }

    #[must_use]
    pub const fn sort_key(&self) -> Option<OffsetDateTime> {
        match self.timestamp {
            Some(ts) => Some(ts),
            None => self.local_timestamp,
        }
    }
}

impl From<Message> for ClientMessage {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            client_message_id: message.client_message_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            conversation_id: message.scope.conversation_id(),
            group_id: message.scope.group_id(),
            kind: message.kind,
            content: message.content,
            nonce: message.nonce,
            reply_to: message.reply_to,
            mentions: message.mentions,
            delivered: message.delivered,
            delivered_at: message.delivered_at,
            read: message.read,
            read_at: message.read_at,
            edited: message.edited,
            edited_at: message.edited_at,
            deleted: message.deleted,
            translation: message.translation,
            transcript: message.transcript,
            metadata: message.metadata,
            timestamp: Some(message.created_at),
            local_timestamp: None,
            temporary: false,
        }
    }
}
