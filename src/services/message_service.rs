use crate::adapters::repository::{Directory, MessageStore};
use crate::config::MessagingConfig;
use crate::domain::clock::MonotonicClock;
use crate::domain::event::EditPayload;
use crate::domain::message::{Message, MessageKind, OutboundMessage, Scope, Target};
use crate::error::{AppError, Result};
use crate::services::conversation_service::ConversationService;
use crate::services::dispatch::DeliveryDispatcher;
use crate::services::enrichment::{EnrichmentJob, EnrichmentService};
use crate::services::rate_limit_service::SenderRateLimiter;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub(crate) struct Metrics {
    pub(crate) sent_total: Counter<u64>,
    pub(crate) updates_total: Counter<u64>,
    pub(crate) history_page_size: Histogram<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter(crate::telemetry::METER_NAME);
        Self {
            sent_total: meter
                .u64_counter("babel_messages_sent_total")
                .with_description("Inbound sends by outcome")
                .build(),
            updates_total: meter
                .u64_counter("babel_message_updates_total")
                .with_description("Edits, deletions, read receipts and delivery acks applied")
                .build(),
            history_page_size: meter
                .u64_histogram("babel_message_history_page_size")
                .with_description("Number of messages returned by a history page")
                .build(),
        }
    }
}

/// Collaborators of the send path, grouped so construction stays readable.
#[derive(Clone, Debug)]
pub struct MessageDeps {
    pub store: Arc<dyn MessageStore>,
    pub directory: Arc<dyn Directory>,
    pub conversations: ConversationService,
    pub dispatcher: DeliveryDispatcher,
    pub enrichment: EnrichmentService,
    pub rate_limiter: Arc<SenderRateLimiter>,
    pub clock: Arc<MonotonicClock>,
}

#[derive(Clone, Debug)]
pub struct MessageService {
    deps: MessageDeps,
    config: MessagingConfig,
    metrics: Metrics,
}

impl MessageService {
    #[must_use]
    pub fn new(deps: MessageDeps, config: MessagingConfig) -> Self {
        Self { deps, config, metrics: Metrics::new() }
    }

    /// Accepts a message: admission check, validation, conversation resolution,
    /// persistence, then immediate fan-out. Enrichment is queued last and never
    /// affects the result.
    ///
    /// # Errors
    /// Returns `AppError::RateLimited` if the sender is over its window,
    /// `AppError::BadRequest` for malformed input,
    /// `AppError::Forbidden` if the sender may not post to the target,
    /// and store errors if persistence fails. Nothing is dispatched on error.
    #[tracing::instrument(
        err(level = "warn"),
        skip(self, outbound),
        fields(sender_id = %sender_id, message_id = tracing::field::Empty)
    )]
    pub async fn send(&self, sender_id: Uuid, outbound: OutboundMessage) -> Result<Message> {
        let result = self.send_inner(sender_id, outbound).await;
        let status = match &result {
            Ok(_) => "success",
            Err(AppError::RateLimited { .. }) => "rate_limited",
            Err(_) => "failure",
        };
        self.metrics.sent_total.add(1, &[KeyValue::new("status", status)]);
        result
    }

    async fn send_inner(&self, sender_id: Uuid, outbound: OutboundMessage) -> Result<Message> {
        self.deps.rate_limiter.check(sender_id)?;
        self.validate_body(&outbound.content, outbound.nonce.as_deref(), outbound.plaintext.as_deref())?;
        self.validate_extras(&outbound)?;

        let (scope, receiver_id) = self.resolve_target(sender_id, outbound.target).await?;

        if let Some(reply_to) = outbound.reply_to {
            match self.deps.store.find(reply_to).await? {
                Some(parent) if parent.scope == scope => {}
                _ => return Err(AppError::BadRequest("reply_to does not reference a message in this chat".into())),
            }
        }

        let mut mentions = outbound.mentions;
        mentions.sort_unstable();
        mentions.dedup();

        let now = self.deps.clock.now();
        let message = Message {
            id: Uuid::now_v7(),
            client_message_id: outbound.client_message_id,
            sender_id,
            receiver_id,
            scope,
            kind: outbound.kind,
            content: outbound.content,
            nonce: outbound.nonce,
            reply_to: outbound.reply_to,
            mentions,
            delivered: false,
            delivered_at: None,
            read: false,
            read_at: None,
            edited: false,
            edited_at: None,
            deleted: false,
            translation: None,
            transcript: None,
            metadata: outbound.metadata,
            created_at: now,
            updated_at: now,
        };

        self.deps.store.insert(&message).await?;
        tracing::Span::current().record("message_id", tracing::field::display(message.id));
        tracing::debug!("Message stored");

        self.deps.dispatcher.deliver_created(&message).await;
        self.deps.enrichment.submit(EnrichmentJob { message: message.clone(), plaintext: outbound.plaintext });

        Ok(message)
    }

    async fn resolve_target(&self, sender_id: Uuid, target: Target) -> Result<(Scope, Option<Uuid>)> {
        match target {
            Target::Resolved(conversation_id) => {
                let conversation = self.deps.conversations.authorize(conversation_id, sender_id).await?;
                Ok((Scope::Conversation(conversation.id), conversation.counterpart(sender_id)))
            }
            Target::NeedsResolution(receiver_id) => {
                let conversation = self.deps.conversations.resolve(sender_id, receiver_id).await?;
                Ok((Scope::Conversation(conversation.id), Some(receiver_id)))
            }
            Target::Group(group_id) => {
                if !self.deps.directory.is_group_member(group_id, sender_id).await? {
                    tracing::warn!(%group_id, %sender_id, "Rejected send by non-member");
                    return Err(AppError::Forbidden);
                }
                Ok((Scope::Group(group_id), None))
            }
        }
    }

    fn validate_body(&self, content: &str, nonce: Option<&str>, plaintext: Option<&str>) -> Result<()> {
        if content.len() > self.config.max_content_bytes {
            return Err(AppError::BadRequest("content too large".into()));
        }
        if plaintext.is_some_and(|p| p.len() > self.config.max_content_bytes) {
            return Err(AppError::BadRequest("plaintext too large".into()));
        }
        if let Some(nonce) = nonce {
            if !STANDARD.decode(nonce).is_ok_and(|n| !n.is_empty()) {
                return Err(AppError::BadRequest("nonce must be non-empty base64".into()));
            }
            if STANDARD.decode(content).is_err() {
                return Err(AppError::BadRequest("encrypted content must be base64".into()));
            }
        }
        Ok(())
    }

    fn validate_extras(&self, outbound: &OutboundMessage) -> Result<()> {
        if outbound.kind == MessageKind::Text && outbound.content.trim().is_empty() {
            return Err(AppError::BadRequest("text message cannot be empty".into()));
        }
        if outbound.mentions.len() > self.config.max_mentions {
            return Err(AppError::BadRequest(format!("at most {} mentions allowed", self.config.max_mentions)));
        }
        if !outbound.metadata.is_object() {
            return Err(AppError::BadRequest("metadata must be an object".into()));
        }
        Ok(())
    }

    async fn load(&self, message_id: Uuid) -> Result<Message> {
        self.deps.store.find(message_id).await?.ok_or(AppError::NotFound)
    }

    /// Replaces the content of one of the caller's own messages.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` if the message does not exist,
    /// `AppError::Forbidden` if the caller is not its sender,
    /// and `AppError::BadRequest` if it was deleted or the new body is invalid.
    #[tracing::instrument(err(level = "warn"), skip(self, edit), fields(message_id = %edit.message_id))]
    pub async fn edit(&self, user_id: Uuid, edit: EditPayload) -> Result<Message> {
        let current = self.load(edit.message_id).await?;
        if current.sender_id != user_id {
            tracing::warn!(%user_id, sender_id = %current.sender_id, "Rejected edit by non-sender");
            return Err(AppError::Forbidden);
        }
        if current.deleted {
            return Err(AppError::BadRequest("message was deleted".into()));
        }
        self.validate_body(&edit.content, edit.nonce.as_deref(), edit.plaintext.as_deref())?;

        let updated = self
            .deps
            .store
            .update_content(edit.message_id, edit.content, edit.nonce, self.deps.clock.now())
            .await?
            .ok_or_else(|| AppError::BadRequest("message was deleted".into()))?;

        self.metrics.updates_total.add(1, &[KeyValue::new("kind", "edit")]);
        self.deps.dispatcher.deliver_updated(&updated).await;
        self.deps.enrichment.submit(EnrichmentJob { message: updated.clone(), plaintext: edit.plaintext });
        Ok(updated)
    }

    /// Soft-deletes one of the caller's own messages. Deleting twice is harmless.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` or `AppError::Forbidden` as for `edit`.
    #[tracing::instrument(err(level = "warn"), skip(self))]
    pub async fn delete(&self, user_id: Uuid, message_id: Uuid) -> Result<Message> {
        let current = self.load(message_id).await?;
        if current.sender_id != user_id {
            tracing::warn!(%user_id, sender_id = %current.sender_id, "Rejected delete by non-sender");
            return Err(AppError::Forbidden);
        }
        if current.deleted {
            return Ok(current);
        }

        let updated =
            self.deps.store.soft_delete(message_id, self.deps.clock.now()).await?.ok_or(AppError::NotFound)?;
        self.metrics.updates_total.add(1, &[KeyValue::new("kind", "delete")]);
        self.deps.dispatcher.deliver_updated(&updated).await;
        Ok(updated)
    }

    /// Records a read receipt. Only the designated receiver may do this.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` if the message does not exist and
    /// `AppError::Forbidden` if the caller is not its receiver.
    #[tracing::instrument(err(level = "warn"), skip(self))]
    pub async fn mark_read(&self, user_id: Uuid, message_id: Uuid) -> Result<Message> {
        let current = self.load(message_id).await?;
        if current.receiver_id != Some(user_id) {
            tracing::warn!(%user_id, %message_id, "Rejected read receipt from non-receiver");
            return Err(AppError::Forbidden);
        }
        if current.read {
            return Ok(current);
        }

        let updated =
            self.deps.store.mark_read(message_id, self.deps.clock.now()).await?.ok_or(AppError::NotFound)?;
        self.metrics.updates_total.add(1, &[KeyValue::new("kind", "read")]);
        self.deps.dispatcher.deliver_updated(&updated).await;
        Ok(updated)
    }

    /// Applies a batch of delivery acknowledgements from `receiver_id`. Ids the
    /// user did not receive are ignored. Returns how many messages changed.
    ///
    /// # Errors
    /// Propagates store failures.
    #[tracing::instrument(err(level = "warn"), skip(self, message_ids), fields(count = message_ids.len()))]
    pub async fn mark_delivered(&self, receiver_id: Uuid, message_ids: &[Uuid]) -> Result<usize> {
        let updated = self.deps.store.mark_delivered(receiver_id, message_ids, self.deps.clock.now()).await?;
        for message in &updated {
            self.deps.dispatcher.deliver_updated(message).await;
        }
        self.metrics.updates_total.add(updated.len() as u64, &[KeyValue::new("kind", "delivered")]);
        Ok(updated.len())
    }

    /// One page of a conversation or group, oldest first, ending before `before`.
    ///
    /// # Errors
    /// Returns `AppError::Forbidden` if the caller cannot read the scope.
    #[tracing::instrument(err(level = "warn"), skip(self))]
    pub async fn history(
        &self,
        user_id: Uuid,
        scope: Scope,
        before: Option<OffsetDateTime>,
        limit: Option<i64>,
    ) -> Result<Vec<Message>> {
        match scope {
            Scope::Conversation(id) => {
                self.deps.conversations.authorize(id, user_id).await?;
            }
            Scope::Group(id) => {
                if !self.deps.directory.is_group_member(id, user_id).await? {
                    tracing::warn!(group_id = %id, %user_id, "Rejected history read by non-member");
                    return Err(AppError::Forbidden);
                }
            }
        }

        let limit = limit.unwrap_or(self.config.history_max_limit).clamp(1, self.config.history_max_limit.max(1));
        let page = self.deps.store.history(scope, before, limit).await?;
        self.metrics.history_page_size.record(page.len() as u64, &[]);
        Ok(page)
    }
}
