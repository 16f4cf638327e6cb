use crate::adapters::repository::{Directory, MessageStore, SyncQuery};
use crate::domain::event::SyncBatch;
use crate::domain::message::Message;
use crate::error::{AppError, Result};
use crate::services::conversation_service::ConversationService;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Metrics {
    requests_total: Counter<u64>,
    batch_size: Histogram<u64>,
    leaked_rows_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter(crate::telemetry::METER_NAME);
        Self {
            requests_total: meter
                .u64_counter("babel_sync_requests_total")
                .with_description("Resync requests by outcome")
                .build(),
            batch_size: meter
                .u64_histogram("babel_sync_batch_size")
                .with_description("Number of messages returned by a single resync")
                .build(),
            leaked_rows_total: meter
                .u64_counter("babel_sync_unauthorized_rows_total")
                .with_description("Rows the store returned that the requester may not see")
                .build(),
        }
    }
}

/// Serves catch-up requests from reconnecting clients.
#[derive(Clone, Debug)]
pub struct SyncService {
    conversations: ConversationService,
    messages: Arc<dyn MessageStore>,
    directory: Arc<dyn Directory>,
    batch_limit: usize,
    metrics: Metrics,
}

impl SyncService {
    #[must_use]
    pub fn new(
        conversations: ConversationService,
        messages: Arc<dyn MessageStore>,
        directory: Arc<dyn Directory>,
        batch_limit: usize,
    ) -> Self {
        Self { conversations, messages, directory, batch_limit: batch_limit.max(1), metrics: Metrics::new() }
    }

    /// Returns the messages `user_id` missed since `last_seen_id`, oldest first,
    /// capped at the batch limit. `truncated` tells the client to ask again.
    ///
    /// # Errors
    /// Any internal failure is reported as `AppError::SyncFailed`; a partial batch
    /// is never returned as if it were complete.
    #[tracing::instrument(err(level = "warn"), skip(self))]
    pub async fn sync(&self, user_id: Uuid, last_seen_id: Option<Uuid>) -> Result<SyncBatch> {
        match self.collect(user_id, last_seen_id).await {
            Ok(batch) => {
                self.metrics.requests_total.add(1, &[KeyValue::new("status", "ok")]);
                self.metrics.batch_size.record(batch.count as u64, &[]);
                Ok(batch)
            }
            Err(e) => {
                tracing::error!(error = %e, "Resync failed");
                self.metrics.requests_total.add(1, &[KeyValue::new("status", "failed")]);
                Err(AppError::SyncFailed)
            }
        }
    }

    async fn collect(&self, user_id: Uuid, last_seen_id: Option<Uuid>) -> Result<SyncBatch> {
        let conversation_ids = self.conversations.ids_for_participant(user_id).await?;
        let group_ids = self.directory.groups_for_user(user_id).await?;
        let mut membership: HashMap<Uuid, bool> = group_ids.iter().map(|id| (*id, true)).collect();

        let after = match last_seen_id {
            Some(id) => match self.messages.find(id).await? {
                Some(anchor) if self.is_visible(&anchor, user_id, &mut membership).await? => Some(anchor.created_at),
                Some(_) => {
                    // Not theirs; don't let its timestamp leak through the window.
                    tracing::warn!(%user_id, last_seen_id = %id, "Resync anchored on a message the user cannot see");
                    None
                }
                None => {
                    tracing::debug!(last_seen_id = %id, "Unknown resync anchor, starting from the beginning");
                    None
                }
            },
            None => None,
        };

        let query = SyncQuery { user_id, conversation_ids, group_ids, after };
        let limit = i64::try_from(self.batch_limit).unwrap_or(i64::MAX);
        let mut rows = self.messages.fetch_since(&query, limit.saturating_add(1)).await?;

        let truncated = rows.len() > self.batch_limit;
        rows.truncate(self.batch_limit);

        let mut authorized = Vec::with_capacity(rows.len());
        for message in rows {
            if self.is_visible(&message, user_id, &mut membership).await? {
                authorized.push(message);
            } else {
                tracing::error!(
                    %user_id,
                    message_id = %message.id,
                    sender_id = %message.sender_id,
                    "Resync query returned a message the requester may not see; dropping it"
                );
                self.metrics.leaked_rows_total.add(1, &[]);
            }
        }

        Ok(SyncBatch::new(authorized, truncated))
    }

    /// Independent re-check of every row: the user sent it, received it, or belongs
    /// to its group. Membership answers are cached for the duration of one request.
    async fn is_visible(&self, message: &Message, user_id: Uuid, membership: &mut HashMap<Uuid, bool>) -> Result<bool> {
        if message.involves(user_id) {
            return Ok(true);
        }
        let Some(group_id) = message.group_id() else {
            return Ok(false);
        };
        if let Some(known) = membership.get(&group_id) {
            return Ok(*known);
        }
        let member = self.directory.is_group_member(group_id, user_id).await?;
        membership.insert(group_id, member);
        Ok(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryConversationStore, MemoryDirectory, MemoryMessageStore};
    use crate::domain::clock::MonotonicClock;
    use crate::domain::message::{MessageKind, MessagePatch, Scope, empty_object};
    use async_trait::async_trait;
    use time::OffsetDateTime;

    /// Ignores the selection entirely, as a buggy query would.
    #[derive(Debug)]
    struct LeakyStore(MemoryMessageStore);

    #[async_trait]
    impl MessageStore for LeakyStore {
        async fn insert(&self, message: &Message) -> Result<()> {
            self.0.insert(message).await
        }
        async fn find(&self, id: Uuid) -> Result<Option<Message>> {
            self.0.find(id).await
        }
        async fn history(&self, scope: Scope, before: Option<OffsetDateTime>, limit: i64) -> Result<Vec<Message>> {
            self.0.history(scope, before, limit).await
        }
        async fn fetch_since(&self, query: &SyncQuery, limit: i64) -> Result<Vec<Message>> {
            let mut all: Vec<Message> = self
                .0
                .snapshot()
                .into_iter()
                .filter(|m| query.after.is_none_or(|after| m.created_at > after))
                .collect();
            all.sort_by_key(|m| (m.created_at, m.id));
            all.truncate(usize::try_from(limit).unwrap_or(0));
            Ok(all)
        }
        async fn update_content(
            &self,
            id: Uuid,
            content: String,
            nonce: Option<String>,
            at: OffsetDateTime,
        ) -> Result<Option<Message>> {
            self.0.update_content(id, content, nonce, at).await
        }
        async fn soft_delete(&self, id: Uuid, at: OffsetDateTime) -> Result<Option<Message>> {
            self.0.soft_delete(id, at).await
        }
        async fn mark_read(&self, id: Uuid, at: OffsetDateTime) -> Result<Option<Message>> {
            self.0.mark_read(id, at).await
        }
        async fn mark_delivered(&self, receiver_id: Uuid, ids: &[Uuid], at: OffsetDateTime) -> Result<Vec<Message>> {
            self.0.mark_delivered(receiver_id, ids, at).await
        }
        async fn apply_patch(
            &self,
            id: Uuid,
            patch: &MessagePatch,
            edited_at: Option<OffsetDateTime>,
            at: OffsetDateTime,
        ) -> Result<Option<Message>> {
            self.0.apply_patch(id, patch, edited_at, at).await
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl crate::adapters::repository::ConversationStore for BrokenStore {
        async fn resolve(&self, _: Uuid, _: Uuid, _: OffsetDateTime) -> Result<crate::domain::conversation::Conversation> {
            Err(AppError::Unavailable("down".into()))
        }
        async fn find(&self, _: Uuid) -> Result<Option<crate::domain::conversation::Conversation>> {
            Err(AppError::Unavailable("down".into()))
        }
        async fn ids_for_participant(&self, _: Uuid) -> Result<Vec<Uuid>> {
            Err(AppError::Unavailable("down".into()))
        }
    }

    struct Fixture {
        clock: Arc<MonotonicClock>,
        conversations: ConversationService,
        directory: Arc<MemoryDirectory>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(MonotonicClock::new());
            let conversations = ConversationService::new(Arc::new(MemoryConversationStore::new()), clock.clone());
            Self { clock, conversations, directory: Arc::new(MemoryDirectory::new()) }
        }

        fn message(&self, sender: Uuid, receiver: Option<Uuid>, scope: Scope) -> Message {
            let now = self.clock.now();
            Message {
                id: Uuid::now_v7(),
                client_message_id: None,
                sender_id: sender,
                receiver_id: receiver,
                scope,
                kind: MessageKind::Text,
                content: "m".into(),
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
                created_at: now,
                updated_at: now,
            }
        }

        fn service(&self, store: Arc<dyn MessageStore>, limit: usize) -> SyncService {
            SyncService::new(self.conversations.clone(), store, self.directory.clone(), limit)
        }
    }

    #[tokio::test]
    async fn test_batch_is_capped_and_flagged() {
        let fx = Fixture::new();
        let store = Arc::new(MemoryMessageStore::new());
        let (me, peer) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = fx.conversations.resolve(me, peer).await.unwrap();
        for _ in 0..150 {
            store.insert(&fx.message(peer, Some(me), Scope::Conversation(conversation.id))).await.unwrap();
        }

        let batch = fx.service(store, 100).sync(me, None).await.unwrap();
        assert_eq!(batch.count, 100);
        assert!(batch.truncated);
        assert!(batch.messages.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }

    #[tokio::test]
    async fn test_resumes_after_last_seen() {
        let fx = Fixture::new();
        let store = Arc::new(MemoryMessageStore::new());
        let (me, peer) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = fx.conversations.resolve(me, peer).await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let m = fx.message(peer, Some(me), Scope::Conversation(conversation.id));
            ids.push(m.id);
            store.insert(&m).await.unwrap();
        }

        let batch = fx.service(store, 100).sync(me, Some(ids[2])).await.unwrap();
        let got: Vec<_> = batch.messages.iter().map(|m| m.id).collect();
        assert_eq!(got, ids[3..].to_vec());
        assert!(!batch.truncated);
    }

    #[tokio::test]
    async fn test_foreign_anchor_is_ignored() {
        let fx = Fixture::new();
        let store = Arc::new(MemoryMessageStore::new());
        let me = Uuid::new_v4();
        let mine = fx.message(Uuid::new_v4(), Some(me), Scope::Conversation(Uuid::new_v4()));
        store.insert(&mine).await.unwrap();
        let foreign = fx.message(Uuid::new_v4(), Some(Uuid::new_v4()), Scope::Conversation(Uuid::new_v4()));
        store.insert(&foreign).await.unwrap();

        let batch = fx.service(store, 100).sync(me, Some(foreign.id)).await.unwrap();
        assert_eq!(batch.count, 1);
        assert_eq!(batch.messages[0].id, mine.id);
    }

    #[tokio::test]
    async fn test_leaky_query_is_filtered() {
        let fx = Fixture::new();
        let inner = MemoryMessageStore::new();
        let (me, peer) = (Uuid::new_v4(), Uuid::new_v4());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let group = Uuid::new_v4();
        let foreign_group = Uuid::new_v4();
        fx.directory.add_member(group, me);

        inner.insert(&fx.message(peer, Some(me), Scope::Conversation(Uuid::new_v4()))).await.unwrap();
        inner.insert(&fx.message(alice, Some(bob), Scope::Conversation(Uuid::new_v4()))).await.unwrap();
        inner.insert(&fx.message(alice, None, Scope::Group(group))).await.unwrap();
        inner.insert(&fx.message(bob, None, Scope::Group(foreign_group))).await.unwrap();

        let batch = fx.service(Arc::new(LeakyStore(inner)), 100).sync(me, None).await.unwrap();
        assert_eq!(batch.count, 2);
        for message in &batch.messages {
            assert!(message.involves(me) || message.group_id() == Some(group));
        }
    }

    #[tokio::test]
    async fn test_store_failure_reports_sync_failed() {
        let fx = Fixture::new();
        let conversations = ConversationService::new(Arc::new(BrokenStore), fx.clock.clone());
        let service =
            SyncService::new(conversations, Arc::new(MemoryMessageStore::new()), fx.directory.clone(), 100);

        assert!(matches!(service.sync(Uuid::new_v4(), None).await, Err(AppError::SyncFailed)));
    }
}
