//! Process-local adapters. Used by the test suite and when the server starts
//! without a database; nothing here survives a restart.

use crate::adapters::repository::{ConversationStore, Directory, MessageStore, SyncQuery};
use crate::adapters::storage::{ObjectStorage, StorageError, StoredObject};
use crate::domain::conversation::{Conversation, canonical_key, ordered_pair};
use crate::domain::message::{Message, MessagePatch, Scope};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    by_key: DashMap<String, Conversation>,
    by_id: DashMap<Uuid, Conversation>,
}

impl MemoryConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn resolve(&self, a: Uuid, b: Uuid, created_at: OffsetDateTime) -> Result<Conversation> {
        let key = canonical_key(a, b);
        // The shard lock held by `entry` makes create-or-fetch atomic per key.
        let conversation = self
            .by_key
            .entry(key.clone())
            .or_insert_with(|| {
                let (participant_a, participant_b) = ordered_pair(a, b);
                Conversation { id: Uuid::now_v7(), canonical_key: key, participant_a, participant_b, created_at }
            })
            .clone();
        self.by_id.entry(conversation.id).or_insert_with(|| conversation.clone());
        Ok(conversation)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.by_id.get(&id).map(|c| c.clone()))
    }

    async fn ids_for_participant(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self.by_id.iter().filter(|c| c.is_participant(user_id)).map(|c| c.id).collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: DashMap<Uuid, Message>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Every stored message, in no particular order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.iter().map(|m| m.value().clone()).collect()
    }

    fn update<F>(&self, id: Uuid, f: F) -> Option<Message>
    where
        F: FnOnce(&mut Message) -> bool,
    {
        let mut entry = self.messages.get_mut(&id)?;
        f(entry.value_mut()).then(|| entry.value().clone())
    }
}

fn take_ordered(mut messages: Vec<Message>, limit: i64) -> Vec<Message> {
    messages.sort_by_key(|m| (m.created_at, m.id));
    messages.truncate(usize::try_from(limit).unwrap_or(0));
    messages
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: &Message) -> Result<()> {
        if self.messages.insert(message.id, message.clone()).is_some() {
            return Err(AppError::Internal);
        }
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Message>> {
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn history(&self, scope: Scope, before: Option<OffsetDateTime>, limit: i64) -> Result<Vec<Message>> {
        let mut page: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.scope == scope && before.is_none_or(|before| m.created_at < before))
            .map(|m| m.clone())
            .collect();
        page.sort_by_key(|m| std::cmp::Reverse((m.created_at, m.id)));
        page.truncate(usize::try_from(limit).unwrap_or(0));
        page.reverse();
        Ok(page)
    }

    async fn fetch_since(&self, query: &SyncQuery, limit: i64) -> Result<Vec<Message>> {
        let matching = self.messages.iter().filter(|m| query.matches(m)).map(|m| m.clone()).collect();
        Ok(take_ordered(matching, limit))
    }

    async fn update_content(
        &self,
        id: Uuid,
        content: String,
        nonce: Option<String>,
        at: OffsetDateTime,
    ) -> Result<Option<Message>> {
        Ok(self.update(id, |m| {
            if m.deleted {
                return false;
            }
            m.apply_edit(content, nonce, at);
            true
        }))
    }

    async fn soft_delete(&self, id: Uuid, at: OffsetDateTime) -> Result<Option<Message>> {
        Ok(self.update(id, |m| {
            m.apply_delete(at);
            true
        }))
    }

    async fn mark_read(&self, id: Uuid, at: OffsetDateTime) -> Result<Option<Message>> {
        Ok(self.update(id, |m| {
            m.apply_read(at);
            true
        }))
    }

    async fn mark_delivered(&self, receiver_id: Uuid, ids: &[Uuid], at: OffsetDateTime) -> Result<Vec<Message>> {
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.update(*id, |m| {
                    if m.receiver_id != Some(receiver_id) || m.delivered {
                        return false;
                    }
                    m.apply_delivered(at);
                    true
                })
            })
            .collect())
    }

    async fn apply_patch(
        &self,
        id: Uuid,
        patch: &MessagePatch,
        edited_at: Option<OffsetDateTime>,
        at: OffsetDateTime,
    ) -> Result<Option<Message>> {
        Ok(self.update(id, |m| {
            if m.deleted || m.edited_at != edited_at {
                return false;
            }
            m.apply_patch(patch.clone(), at);
            true
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    members: DashMap<Uuid, HashSet<Uuid>>,
    languages: DashMap<Uuid, String>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, group_id: Uuid, user_id: Uuid) {
        self.members.entry(group_id).or_default().insert(user_id);
    }

    pub fn set_language(&self, user_id: Uuid, language: impl Into<String>) {
        self.languages.insert(user_id, language.into());
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn is_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        Ok(self.members.get(&group_id).is_some_and(|m| m.contains(&user_id)))
    }

    async fn group_members(&self, group_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self.members.get(&group_id).map(|m| m.iter().copied().collect()).unwrap_or_default())
    }

    async fn groups_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self.members.iter().filter(|g| g.contains(&user_id)).map(|g| *g.key()).collect())
    }

    async fn preferred_language(&self, user_id: Uuid) -> Result<Option<String>> {
        Ok(self.languages.get(&user_id).map(|l| l.clone()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryObjectStorage {
    objects: DashMap<String, StoredObject>,
}

impl MemoryObjectStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, bytes: impl Into<Bytes>, content_type: Option<&str>) {
        self.objects.insert(
            key.into(),
            StoredObject { bytes: bytes.into(), content_type: content_type.map(ToString::to_string) },
        );
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn get(&self, key: &str, max_size: usize) -> std::result::Result<StoredObject, StorageError> {
        let object = self.objects.get(key).ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        if object.bytes.len() > max_size {
            return Err(StorageError::TooLarge { size: object.bytes.len() as u64, max: max_size });
        }
        Ok(object.clone())
    }

    async fn ping(&self) -> std::result::Result<(), StorageError> {
        Ok(())
    }
}
