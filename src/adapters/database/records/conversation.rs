use crate::domain::conversation::Conversation;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub struct ConversationRecord {
    pub(crate) id: Uuid,
    pub(crate) canonical_key: String,
    pub(crate) participant_a: Uuid,
    pub(crate) participant_b: Uuid,
    pub(crate) created_at: OffsetDateTime,
}

impl From<ConversationRecord> for Conversation {
    fn from(record: ConversationRecord) -> Self {
        Self {
            id: record.id,
            canonical_key: record.canonical_key,
            participant_a: record.participant_a,
            participant_b: record.participant_b,
            created_at: record.created_at,
        }
    }
}
