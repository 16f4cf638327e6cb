use crate::adapters::database::DbPool;
use crate::adapters::database::records::MessageRecord;
use crate::adapters::repository::{MessageStore, SyncQuery};
use crate::domain::message::{Message, MessagePatch, Scope};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use sqlx::Postgres;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

macro_rules! message_columns {
    () => {
        "id, client_message_id, sender_id, receiver_id, conversation_id, group_id, message_type, content, nonce, \
         reply_to, mentions, delivered, delivered_at, read, read_at, edited, edited_at, deleted, translation, \
         transcript, metadata, created_at, updated_at"
    };
}

type MessageQuery<'q> = QueryAs<'q, Postgres, MessageRecord, PgArguments>;

#[derive(Clone, Debug)]
pub struct PgMessageStore {
    pool: DbPool,
}

impl PgMessageStore {
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_optional(&self, query: MessageQuery<'_>) -> Result<Option<Message>> {
        query.fetch_optional(&self.pool).await?.map(Message::try_from).transpose()
    }
}

fn into_messages(records: Vec<MessageRecord>) -> Result<Vec<Message>> {
    records.into_iter().map(Message::try_from).collect()
}

#[async_trait]
impl MessageStore for PgMessageStore {
    #[tracing::instrument(level = "debug", skip(self, message), fields(message_id = %message.id), err(level = "warn"))]
    async fn insert(&self, message: &Message) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (
                id, client_message_id, sender_id, receiver_id, conversation_id, group_id, message_type,
                content, nonce, reply_to, mentions, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            "#,
        )
        .bind(message.id)
        .bind(message.client_message_id)
        .bind(message.sender_id)
        .bind(message.receiver_id)
        .bind(message.conversation_id())
        .bind(message.group_id())
        .bind(message.kind.as_str())
        .bind(&message.content)
        .bind(&message.nonce)
        .bind(message.reply_to)
        .bind(&message.mentions)
        .bind(Json(&message.metadata))
        .bind(message.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23503") => {
                // Foreign key violation: the conversation vanished underneath us
                Err(AppError::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
    async fn find(&self, id: Uuid) -> Result<Option<Message>> {
        self.fetch_one_optional(
            sqlx::query_as::<_, MessageRecord>(concat!("SELECT ", message_columns!(), " FROM messages WHERE id = $1"))
                .bind(id),
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
    async fn history(&self, scope: Scope, before: Option<OffsetDateTime>, limit: i64) -> Result<Vec<Message>> {
        let records = sqlx::query_as::<_, MessageRecord>(concat!(
            "SELECT * FROM (SELECT ",
            message_columns!(),
            r#"
            FROM messages
            WHERE (conversation_id = $1 OR group_id = $2)
              AND ($3::timestamptz IS NULL OR created_at < $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            ) page
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(scope.conversation_id())
        .bind(scope.group_id())
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_messages(records)
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, query),
        fields(user_id = %query.user_id, conversations = query.conversation_ids.len(), groups = query.group_ids.len()),
        err(level = "warn")
    )]
    async fn fetch_since(&self, query: &SyncQuery, limit: i64) -> Result<Vec<Message>> {
        let records = sqlx::query_as::<_, MessageRecord>(concat!(
            "SELECT ",
            message_columns!(),
            r#"
            FROM messages
            WHERE (conversation_id = ANY($1) OR group_id = ANY($2) OR sender_id = $3 OR receiver_id = $3)
              AND ($4::timestamptz IS NULL OR created_at > $4)
            ORDER BY created_at ASC, id ASC
            LIMIT $5
            "#
        ))
        .bind(&query.conversation_ids)
        .bind(&query.group_ids)
        .bind(query.user_id)
        .bind(query.after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_messages(records)
    }

    #[tracing::instrument(level = "debug", skip(self, content, nonce), err(level = "warn"))]
    async fn update_content(
        &self,
        id: Uuid,
        content: String,
        nonce: Option<String>,
        at: OffsetDateTime,
    ) -> Result<Option<Message>> {
        self.fetch_one_optional(
            sqlx::query_as::<_, MessageRecord>(concat!(
                r#"
                UPDATE messages
                SET content = $2, nonce = $3, edited = TRUE, edited_at = $4, translation = NULL, updated_at = $4
                WHERE id = $1 AND deleted = FALSE
                RETURNING "#,
                message_columns!()
            ))
            .bind(id)
            .bind(content)
            .bind(nonce)
            .bind(at),
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
    async fn soft_delete(&self, id: Uuid, at: OffsetDateTime) -> Result<Option<Message>> {
        self.fetch_one_optional(
            sqlx::query_as::<_, MessageRecord>(concat!(
                r#"
                UPDATE messages
                SET deleted = TRUE, content = '', nonce = NULL, translation = NULL, transcript = NULL, updated_at = $2
                WHERE id = $1
                RETURNING "#,
                message_columns!()
            ))
            .bind(id)
            .bind(at),
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
    async fn mark_read(&self, id: Uuid, at: OffsetDateTime) -> Result<Option<Message>> {
        self.fetch_one_optional(
            sqlx::query_as::<_, MessageRecord>(concat!(
                r#"
                UPDATE messages
                SET read = TRUE,
                    read_at = COALESCE(read_at, $2),
                    delivered = TRUE,
                    delivered_at = COALESCE(delivered_at, $2),
                    updated_at = $2
                WHERE id = $1
                RETURNING "#,
                message_columns!()
            ))
            .bind(id)
            .bind(at),
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, ids), fields(count = ids.len()), err(level = "warn"))]
    async fn mark_delivered(&self, receiver_id: Uuid, ids: &[Uuid], at: OffsetDateTime) -> Result<Vec<Message>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let records = sqlx::query_as::<_, MessageRecord>(concat!(
            r#"
            UPDATE messages
            SET delivered = TRUE, delivered_at = $3, updated_at = $3
            WHERE id = ANY($2) AND receiver_id = $1 AND delivered = FALSE
            RETURNING "#,
            message_columns!()
        ))
        .bind(receiver_id)
        .bind(ids)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        into_messages(records)
    }

    #[tracing::instrument(level = "debug", skip(self, patch), err(level = "warn"))]
    async fn apply_patch(
        &self,
        id: Uuid,
        patch: &MessagePatch,
        edited_at: Option<OffsetDateTime>,
        at: OffsetDateTime,
    ) -> Result<Option<Message>> {
        let (translation, transcript) = match patch {
            MessagePatch::Translation(t) => (Some(Json(t)), None),
            MessagePatch::Transcript(t) => (None, Some(Json(t))),
        };

        self.fetch_one_optional(
            sqlx::query_as::<_, MessageRecord>(concat!(
                r#"
                UPDATE messages
                SET translation = COALESCE($2, translation),
                    transcript = COALESCE($3, transcript),
                    updated_at = $4
                WHERE id = $1 AND deleted = FALSE AND edited_at IS NOT DISTINCT FROM $5
                RETURNING "#,
                message_columns!()
            ))
            .bind(id)
            .bind(translation)
            .bind(transcript)
            .bind(at)
            .bind(edited_at),
        )
        .await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
