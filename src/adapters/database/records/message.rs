use crate::domain::message::{Message, Scope, Transcript, Translation};
use crate::error::AppError;
use serde_json::Value;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub struct MessageRecord {
    pub(crate) id: Uuid,
    pub(crate) client_message_id: Option<Uuid>,
    pub(crate) sender_id: Uuid,
    pub(crate) receiver_id: Option<Uuid>,
    pub(crate) conversation_id: Option<Uuid>,
    pub(crate) group_id: Option<Uuid>,
    pub(crate) message_type: String,
    pub(crate) content: String,
    pub(crate) nonce: Option<String>,
    pub(crate) reply_to: Option<Uuid>,
    pub(crate) mentions: Vec<Uuid>,
    pub(crate) delivered: bool,
    pub(crate) delivered_at: Option<OffsetDateTime>,
    pub(crate) read: bool,
    pub(crate) read_at: Option<OffsetDateTime>,
    pub(crate) edited: bool,
    pub(crate) edited_at: Option<OffsetDateTime>,
    pub(crate) deleted: bool,
    pub(crate) translation: Option<Json<Translation>>,
    pub(crate) transcript: Option<Json<Transcript>>,
    pub(crate) metadata: Json<Value>,
    pub(crate) created_at: OffsetDateTime,
    pub(crate) updated_at: OffsetDateTime,
}

impl TryFrom<MessageRecord> for Message {
    type Error = AppError;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        let scope = match (record.conversation_id, record.group_id) {
            (Some(id), None) => Scope::Conversation(id),
            (None, Some(id)) => Scope::Group(id),
            _ => {
                tracing::error!(message_id = %record.id, "Stored message has no single scope");
                return Err(AppError::Internal);
            }
        };
        let kind = record.message_type.parse().map_err(|e| {
            tracing::error!(message_id = %record.id, error = %e, "Stored message has unknown type");
            AppError::Internal
        })?;

        Ok(Self {
            id: record.id,
            client_message_id: record.client_message_id,
            sender_id: record.sender_id,
            receiver_id: record.receiver_id,
            scope,
            kind,
            content: record.content,
            nonce: record.nonce,
            reply_to: record.reply_to,
            mentions: record.mentions,
            delivered: record.delivered,
            delivered_at: record.delivered_at,
            read: record.read,
            read_at: record.read_at,
            edited: record.edited,
            edited_at: record.edited_at,
            deleted: record.deleted,
            translation: record.translation.map(|Json(t)| t),
            transcript: record.transcript.map(|Json(t)| t),
            metadata: record.metadata.0,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}
