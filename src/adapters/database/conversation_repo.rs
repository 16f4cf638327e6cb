use crate::adapters::database::DbPool;
use crate::adapters::database::records::ConversationRecord;
use crate::adapters::repository::ConversationStore;
use crate::domain::conversation::{Conversation, canonical_key, ordered_pair};
use crate::error::Result;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct PgConversationStore {
    pool: DbPool,
}

impl PgConversationStore {
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    #[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
    async fn resolve(&self, a: Uuid, b: Uuid, created_at: OffsetDateTime) -> Result<Conversation> {
        let (participant_a, participant_b) = ordered_pair(a, b);

        // The no-op DO UPDATE makes RETURNING yield the existing row on conflict,
        // leaving its participants and creation time as first written.
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            INSERT INTO conversations (id, canonical_key, participant_a, participant_b, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (canonical_key) DO UPDATE SET canonical_key = EXCLUDED.canonical_key
            RETURNING id, canonical_key, participant_a, participant_b, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(canonical_key(a, b))
        .bind(participant_a)
        .bind(participant_b)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(record.into())
    }

    #[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
    async fn find(&self, id: Uuid) -> Result<Option<Conversation>> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            "SELECT id, canonical_key, participant_a, participant_b, created_at FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(Into::into))
    }

    #[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
    async fn ids_for_participant(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM conversations WHERE participant_a = $1 OR participant_b = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
