//! Client-side half of the synchronization protocol.

pub mod model;
pub mod reconcile;
pub mod supervisor;
pub mod transport;

pub use model::ClientMessage;
pub use reconcile::{ReconcileOptions, apply_update, merge};
pub use supervisor::{ConnectError, ConnectionState, Connector, SupervisorConfig, SupervisorHandle, Transport};
pub use transport::{WsConnector, WsTransport};

use uuid::Uuid;

/// The anchor to send with a `sync` frame: the newest message the server has
/// confirmed. Optimistic entries are never anchors.
#[must_use]
pub fn last_seen_id(messages: &[ClientMessage]) -> Option<Uuid> {
    messages.iter().filter(|m| !m.temporary && m.timestamp.is_some()).max_by_key(|m| (m.timestamp, m.id)).map(|m| m.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::MessageKind;
    use time::OffsetDateTime;

    #[test]
    fn test_last_seen_skips_optimistic() {
        let now = OffsetDateTime::now_utc();
        let mut confirmed = ClientMessage::optimistic(Uuid::new_v4(), None, MessageKind::Text, "a", now);
        confirmed.temporary = false;
        confirmed.timestamp = Some(now);
        let pending = ClientMessage::optimistic(Uuid::new_v4(), None, MessageKind::Text, "b", now);

        assert_eq!(last_seen_id(&[confirmed.clone(), pending]), Some(confirmed.id));
        assert_eq!(last_seen_id(&[]), None);
    }
}
