use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub const KEY_SEPARATOR: char = ':';

/// Order-independent key for the conversation between two participants.
#[must_use]
pub fn canonical_key(a: Uuid, b: Uuid) -> String {
    let (low, high) = ordered_pair(a, b);
    format!("{low}{KEY_SEPARATOR}{high}")
}

/// Returns the two identities in lexicographic order.
#[must_use]
pub fn ordered_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b { (a, b) } else { (b, a) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub canonical_key: String,
    pub participant_a: Uuid,
    pub participant_b: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Conversation {
    #[must_use]
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    /// The other participant, or the caller itself for a note-to-self conversation.
    #[must_use]
    pub fn counterpart(&self, user_id: Uuid) -> Option<Uuid> {
        if self.participant_a == user_id {
            Some(self.participant_b)
        } else if self.participant_b == user_id {
            Some(self.participant_a)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(canonical_key(a, b), canonical_key(b, a));
    }

    #[test]
    fn test_canonical_key_sorts_lexicographically() {
        let low = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        let high = Uuid::parse_str("ffffffff-0000-0000-0000-000000000000").unwrap();
        assert_eq!(
            canonical_key(high, low),
            "00000000-0000-0000-0000-000000000001:ffffffff-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_counterpart() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (participant_a, participant_b) = ordered_pair(a, b);
        let conversation = Conversation {
            id: Uuid::new_v4(),
            canonical_key: canonical_key(a, b),
            participant_a,
            participant_b,
            created_at: OffsetDateTime::now_utc(),
        };

        assert_eq!(conversation.counterpart(a), Some(b));
        assert_eq!(conversation.counterpart(b), Some(a));
        assert_eq!(conversation.counterpart(Uuid::new_v4()), None);
        assert!(!conversation.is_participant(Uuid::new_v4()));
    }
}
