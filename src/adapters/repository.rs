use crate::domain::conversation::Conversation;
use crate::domain::message::{Message, MessagePatch, Scope};
use crate::error::Result;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Durable conversation records, one per unordered participant pair.
#[async_trait]
pub trait ConversationStore: Send + Sync + std::fmt::Debug {
    /// Atomically fetches the conversation between `a` and `b`, creating it on first
    /// contact. Concurrent callers racing on the same pair all get the same record.
    async fn resolve(&self, a: Uuid, b: Uuid, created_at: OffsetDateTime) -> Result<Conversation>;

    async fn find(&self, id: Uuid) -> Result<Option<Conversation>>;

    async fn ids_for_participant(&self, user_id: Uuid) -> Result<Vec<Uuid>>;
}

/// Selection for a resync read: everything in the listed scopes, plus anything
/// sent or received by `user_id`, strictly after `after`.
#[derive(Debug, Clone, Default)]
pub struct SyncQuery {
    pub user_id: Uuid,
    pub conversation_ids: Vec<Uuid>,
    pub group_ids: Vec<Uuid>,
    pub after: Option<OffsetDateTime>,
}

impl SyncQuery {
    /// In-process evaluation of the selection, shared by the memory adapter.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        let in_scope = match message.scope {
            Scope::Conversation(id) => self.conversation_ids.contains(&id),
            Scope::Group(id) => self.group_ids.contains(&id),
        };
        (in_scope || message.involves(self.user_id)) && self.after.is_none_or(|after| message.created_at > after)
    }
}

/// Append-only message log ordered by server timestamp. Mutations return the
/// updated row, or `None` when no row qualified.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    async fn insert(&self, message: &Message) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<Message>>;

    /// Up to `limit` messages of one scope created before `before`, oldest first.
    async fn history(&self, scope: Scope, before: Option<OffsetDateTime>, limit: i64) -> Result<Vec<Message>>;

    /// Up to `limit` messages matching `query`, ordered by server timestamp.
    async fn fetch_since(&self, query: &SyncQuery, limit: i64) -> Result<Vec<Message>>;

    /// Replaces the body of a live message. Deleted messages are left untouched.
    async fn update_content(
        &self,
        id: Uuid,
        content: String,
        nonce: Option<String>,
        at: OffsetDateTime,
    ) -> Result<Option<Message>>;

    async fn soft_delete(&self, id: Uuid, at: OffsetDateTime) -> Result<Option<Message>>;

    async fn mark_read(&self, id: Uuid, at: OffsetDateTime) -> Result<Option<Message>>;

    /// Flags as delivered the listed messages addressed to `receiver_id`, returning
    /// only the rows that changed.
    async fn mark_delivered(&self, receiver_id: Uuid, ids: &[Uuid], at: OffsetDateTime) -> Result<Vec<Message>>;

    /// Writes enrichment output unless the message has since been deleted or
    /// edited. `edited_at` is the edit stamp of the copy the output was computed
    /// from; a row whose stamp differs is left alone and `None` is returned.
    async fn apply_patch(
        &self,
        id: Uuid,
        patch: &MessagePatch,
        edited_at: Option<OffsetDateTime>,
        at: OffsetDateTime,
    ) -> Result<Option<Message>>;

    async fn ping(&self) -> Result<()>;
}

/// Read-only view of user profiles and group membership owned by other services.
#[async_trait]
pub trait Directory: Send + Sync + std::fmt::Debug {
    async fn is_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool>;

    async fn group_members(&self, group_id: Uuid) -> Result<Vec<Uuid>>;

    async fn groups_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>>;

    async fn preferred_language(&self, user_id: Uuid) -> Result<Option<String>>;
}
