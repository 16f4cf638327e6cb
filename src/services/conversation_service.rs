use crate::adapters::repository::ConversationStore;
use crate::domain::clock::MonotonicClock;
use crate::domain::conversation::Conversation;
use crate::error::{AppError, Result};
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Metrics {
    resolved_total: Counter<u64>,
    denied_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter(crate::telemetry::METER_NAME);
        Self {
            resolved_total: meter
                .u64_counter("babel_conversations_resolved_total")
                .with_description("Conversation create-or-fetch operations")
                .build(),
            denied_total: meter
                .u64_counter("babel_conversation_access_denied_total")
                .with_description("Conversation accesses rejected for non-participants")
                .build(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
    clock: Arc<MonotonicClock>,
    metrics: Metrics,
}

impl ConversationService {
    #[must_use]
    pub fn new(store: Arc<dyn ConversationStore>, clock: Arc<MonotonicClock>) -> Self {
        Self { store, clock, metrics: Metrics::new() }
    }

    /// Returns the single conversation between `a` and `b`, creating it on first contact.
    ///
    /// # Errors
    /// Propagates store failures. No conversation id is ever made up on failure.
    #[tracing::instrument(err(level = "warn"), skip(self))]
    pub async fn resolve(&self, a: Uuid, b: Uuid) -> Result<Conversation> {
        let conversation = self.store.resolve(a, b, self.clock.now()).await?;
        self.metrics.resolved_total.add(1, &[]);
        Ok(conversation)
    }

    /// Loads a conversation on behalf of `user_id`.
    ///
    /// # Errors
    /// Returns `AppError::Forbidden` if the conversation does not exist or the user
    /// is not one of its participants. Both cases look the same to the caller.
    #[tracing::instrument(err(level = "debug"), skip(self))]
    pub async fn authorize(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Conversation> {
        match self.store.find(conversation_id).await? {
            Some(conversation) if conversation.is_participant(user_id) => Ok(conversation),
            Some(_) => {
                tracing::warn!(%conversation_id, %user_id, "Rejected access by non-participant");
                self.metrics.denied_total.add(1, &[KeyValue::new("reason", "not_participant")]);
                Err(AppError::Forbidden)
            }
            None => {
                tracing::warn!(%conversation_id, %user_id, "Rejected access to unknown conversation");
                self.metrics.denied_total.add(1, &[KeyValue::new("reason", "unknown")]);
                Err(AppError::Forbidden)
            }
        }
    }

    /// # Errors
    /// Propagates store failures.
    pub async fn ids_for_participant(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.store.ids_for_participant(user_id).await
    }
}
