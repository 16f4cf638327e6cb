use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    Document,
    Call,
}

#[derive(Debug, Error)]
#[error("unknown message type: {0}")]
pub struct UnknownMessageKind(pub String);

impl MessageKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Document => "document",
            Self::Call => "call",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "document" => Ok(Self::Document),
            "call" => Ok(Self::Call),
            other => Err(UnknownMessageKind(other.to_string())),
        }
    }
}

/// Where a message lives: a direct conversation or a group, never both.
///
/// On the wire this flattens into `conversation_id` / `group_id`, exactly one of
/// which is non-null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ScopeRepr", into = "ScopeRepr")]
pub enum Scope {
    Conversation(Uuid),
    Group(Uuid),
}

impl Scope {
    #[must_use]
    pub const fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::Conversation(id) => Some(*id),
            Self::Group(_) => None,
        }
    }

    #[must_use]
    pub const fn group_id(&self) -> Option<Uuid> {
        match self {
            Self::Group(id) => Some(*id),
            Self::Conversation(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScopeRepr {
    conversation_id: Option<Uuid>,
    group_id: Option<Uuid>,
}

#[derive(Debug, Error)]
#[error("exactly one of conversation_id or group_id must be set")]
pub struct AmbiguousScope;

impl TryFrom<ScopeRepr> for Scope {
    type Error = AmbiguousScope;

    fn try_from(repr: ScopeRepr) -> Result<Self, Self::Error> {
        match (repr.conversation_id, repr.group_id) {
            (Some(id), None) => Ok(Self::Conversation(id)),
            (None, Some(id)) => Ok(Self::Group(id)),
            _ => Err(AmbiguousScope),
        }
    }
}

impl From<Scope> for ScopeRepr {
    fn from(scope: Scope) -> Self {
        Self { conversation_id: scope.conversation_id(), group_id: scope.group_id() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub text: String,
    pub source_language: String,
    pub target_language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub language: String,
    pub translated_text: Option<String>,
    pub target_language: Option<String>,
}

/// Derived content written back onto a stored message by the enrichment pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePatch {
    Translation(Translation),
    Transcript(Transcript),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(default)]
    pub client_message_id: Option<Uuid>,
    pub sender_id: Uuid,
    #[serde(default)]
    pub receiver_id: Option<Uuid>,
    #[serde(flatten)]
    pub scope: Scope,
    #[serde(rename = "type")]
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
    #[serde(default = "empty_object")]
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

pub(crate) fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Message {
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.nonce.is_some()
    }

    #[must_use]
    pub const fn conversation_id(&self) -> Option<Uuid> {
        self.scope.conversation_id()
    }

    #[must_use]
    pub const fn group_id(&self) -> Option<Uuid> {
        self.scope.group_id()
    }

    /// Direct participants: the sender and, for direct messages, the receiver.
    #[must_use]
    pub fn involves(&self, user_id: Uuid) -> bool {
        self.sender_id == user_id || self.receiver_id == Some(user_id)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn apply_edit(&mut self, content: String, nonce: Option<String>, at: OffsetDateTime) {
        self.content = content;
        self.nonce = nonce;
        self.edited = true;
        self.edited_at = Some(at);
        self.translation = None;
        self.updated_at = at;
    }

    /// Tombstones the message. The row stays so ordering and resync keep working.
    pub fn apply_delete(&mut self, at: OffsetDateTime) {
        self.deleted = true;
        self.content.clear();
        self.nonce = None;
        self.translation = None;
        self.transcript = None;
        self.updated_at = at;
    }

    pub fn apply_read(&mut self, at: OffsetDateTime) {
        if !self.read {
            self.read = true;
            self.read_at = Some(at);
        }
        if !self.delivered {
            self.delivered = true;
            self.delivered_at = Some(at);
        }
        self.updated_at = at;
    }

    pub fn apply_delivered(&mut self, at: OffsetDateTime) {
        if !self.delivered {
            self.delivered = true;
            self.delivered_at = Some(at);
            self.updated_at = at;
        }
    }

    pub fn apply_patch(&mut self, patch: MessagePatch, at: OffsetDateTime) {
        match patch {
            MessagePatch::Translation(translation) => self.translation = Some(translation),
            MessagePatch::Transcript(transcript) => self.transcript = Some(transcript),
        }
        self.updated_at = at;
    }
}

/// Where a send is headed, decided once at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Client supplied the conversation id; membership must still be verified.
    Resolved(Uuid),
    /// Only the receiver is known; the conversation is created or fetched.
    NeedsResolution(Uuid),
    Group(Uuid),
}

/// A validated inbound send, before the server has assigned identity or time.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub client_message_id: Option<Uuid>,
    pub target: Target,
    pub kind: MessageKind,
    pub content: String,
    pub nonce: Option<String>,
    /// Plaintext copy of an encrypted body, used only for translation and never stored.
    pub plaintext: Option<String>,
    pub reply_to: Option<Uuid>,
    pub mentions: Vec<Uuid>,
    pub metadata: Value,
}
