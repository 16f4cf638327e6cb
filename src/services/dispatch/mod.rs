pub mod hub;

pub use hub::{EventReceiver, LocalSessionHub, SessionHub};

use crate::adapters::repository::Directory;
use crate::domain::event::ServerEvent;
use crate::domain::message::{Message, Scope};
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Metrics {
    dispatched_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter(crate::telemetry::METER_NAME);
        Self {
            dispatched_total: meter
                .u64_counter("babel_messages_dispatched_total")
                .with_description("Message events fanned out to live sessions")
                .build(),
        }
    }
}

/// Routes message events to the live sessions of everyone entitled to see them:
/// the sender's own sessions plus the receiver's, or every group member's.
///
/// Delivery is best effort. Nothing is retried here; offline users catch up
/// through resync.
#[derive(Clone, Debug)]
pub struct DeliveryDispatcher {
    hub: Arc<dyn SessionHub>,
    directory: Arc<dyn Directory>,
    metrics: Metrics,
}

impl DeliveryDispatcher {
    #[must_use]
    pub fn new(hub: Arc<dyn SessionHub>, directory: Arc<dyn Directory>) -> Self {
        Self { hub, directory, metrics: Metrics::new() }
    }

    pub async fn deliver_created(&self, message: &Message) {
        self.fan_out(message, ServerEvent::MessageCreated { message: message.clone() }, "created").await;
    }

    pub async fn deliver_updated(&self, message: &Message) {
        self.fan_out(message, ServerEvent::MessageUpdated { message: message.clone() }, "updated").await;
    }

    async fn audience(&self, message: &Message) -> BTreeSet<Uuid> {
        let mut audience = BTreeSet::from([message.sender_id]);
        match message.scope {
            Scope::Conversation(_) => audience.extend(message.receiver_id),
            Scope::Group(group_id) => match self.directory.group_members(group_id).await {
                Ok(members) => audience.extend(members),
                Err(e) => {
                    // Members still get it on their next resync.
                    tracing::error!(error = %e, %group_id, "Failed to load group members for fan-out");
                }
            },
        }
        audience
    }

    #[tracing::instrument(level = "debug", skip(self, message, event), fields(message_id = %message.id))]
    async fn fan_out(&self, message: &Message, event: ServerEvent, kind: &'static str) {
        let event = Arc::new(event);
        let mut sessions = 0;
        for user_id in self.audience(message).await {
            sessions += self.hub.publish(user_id, Arc::clone(&event));
        }
        tracing::debug!(sessions, "Dispatched message event");
        self.metrics.dispatched_total.add(1, &[KeyValue::new("event", kind)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryDirectory;
    use crate::domain::message::{MessageKind, empty_object};
    use time::OffsetDateTime;

    fn message(sender: Uuid, receiver: Option<Uuid>, scope: Scope) -> Message {
        let now = OffsetDateTime::now_utc();
        Message {
            id: Uuid::now_v7(),
            client_message_id: None,
            sender_id: sender,
            receiver_id: receiver,
            scope,
            kind: MessageKind::Text,
            content: "hi".into(),
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

    #[tokio::test]
    async fn test_direct_message_reaches_sender_and_receiver_only() {
        let hub = Arc::new(LocalSessionHub::new(8));
        let dispatcher = DeliveryDispatcher::new(hub.clone(), Arc::new(MemoryDirectory::new()));
        let (sender, receiver, bystander) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut sender_rx = hub.subscribe(sender);
        let mut receiver_rx = hub.subscribe(receiver);
        let mut bystander_rx = hub.subscribe(bystander);

        dispatcher.deliver_created(&message(sender, Some(receiver), Scope::Conversation(Uuid::new_v4()))).await;

        assert!(matches!(*sender_rx.recv().await.unwrap(), ServerEvent::MessageCreated { .. }));
        assert!(matches!(*receiver_rx.recv().await.unwrap(), ServerEvent::MessageCreated { .. }));
        assert!(bystander_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_group_message_reaches_members() {
        let hub = Arc::new(LocalSessionHub::new(8));
        let directory = Arc::new(MemoryDirectory::new());
        let group = Uuid::new_v4();
        let (sender, member) = (Uuid::new_v4(), Uuid::new_v4());
        directory.add_member(group, sender);
        directory.add_member(group, member);
        let dispatcher = DeliveryDispatcher::new(hub.clone(), directory);
        let mut sender_rx = hub.subscribe(sender);
        let mut member_rx = hub.subscribe(member);

        dispatcher.deliver_updated(&message(sender, None, Scope::Group(group))).await;

        assert!(matches!(*member_rx.recv().await.unwrap(), ServerEvent::MessageUpdated { .. }));
        // Sender appears once even though it is also a member.
        assert!(sender_rx.recv().await.is_ok());
        assert!(sender_rx.try_recv().is_err());
    }
}
