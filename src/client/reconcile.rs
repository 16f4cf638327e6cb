//! Merging of server-confirmed, peer-pushed and optimistic messages into the
//! single list a client renders.
//!
//! An optimistic entry is promoted when a confirmed message echoes its
//! `client_message_id`. Without that id the engine falls back to a fuzzy match
//! on sender, receiver, type and content within a time window. The fallback is
//! an approximation and can be switched off.

use crate::client::model::ClientMessage;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Largest timestamp gap at which an optimistic entry still matches a confirmed one.
    pub window: Duration,
    /// Allow promotion by content match when no correlation id is present.
    pub heuristic: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self { window: Duration::from_secs(10), heuristic: true }
    }
}

/// Merges `incoming` into `current` and returns the result ordered by timestamp.
///
/// Merging the same batch twice gives the same list as merging it once, and no
/// id ever appears twice in the output.
#[must_use]
pub fn merge(current: &[ClientMessage], incoming: &[ClientMessage], options: ReconcileOptions) -> Vec<ClientMessage> {
    let mut by_id: HashMap<Uuid, ClientMessage> = current.iter().map(|m| (m.id, m.clone())).collect();

    for message in incoming {
        if let Some(existing) = by_id.get_mut(&message.id) {
            match (existing.temporary, message.temporary) {
                (true, _) => *existing = message.clone(),
                (false, false) => merge_fields(existing, message),
                // A replayed optimistic copy never downgrades a confirmed entry.
                (false, true) => {}
            }
            continue;
        }

        // An optimistic copy that a held confirmed entry already stands for was
        // promoted earlier, possibly by a later entry of this same batch.
        if message.temporary && by_id.values().any(|held| !held.temporary && stands_for(held, message, options)) {
            continue;
        }

        if !message.temporary
            && let Some(optimistic_id) = find_optimistic(&by_id, message, options)
            && let Some(optimistic) = by_id.remove(&optimistic_id)
        {
            let mut promoted = message.clone();
            merge_metadata(&mut promoted.metadata, &optimistic.metadata, false);
            promoted.local_timestamp = promoted.local_timestamp.or(optimistic.local_timestamp);
            by_id.insert(promoted.id, promoted);
            continue;
        }

        by_id.insert(message.id, message.clone());
    }

    let mut merged: Vec<ClientMessage> = by_id.into_values().collect();
    sort_messages(&mut merged);
    merged
}

/// Applies a `message_updated` event to a held list. Returns `false` and leaves
/// the list alone when the message is not held (deleted locally, never loaded).
pub fn apply_update(messages: &mut [ClientMessage], update: &ClientMessage) -> bool {
    match messages.iter_mut().find(|m| m.id == update.id) {
        Some(existing) if existing.temporary => {
            *existing = update.clone();
            true
        }
        Some(existing) => {
            merge_fields(existing, update);
            true
        }
        None => false,
    }
}

/// Ascending by server timestamp, then local creation time. Entries without any
/// timestamp go last; ids break ties so the order is total.
pub fn sort_messages(messages: &mut [ClientMessage]) {
    messages.sort_by(|a, b| {
        let (ka, kb) = (a.sort_key(), b.sort_key());
        ka.is_none().cmp(&kb.is_none()).then(ka.cmp(&kb)).then(a.id.cmp(&b.id))
    });
}

fn find_optimistic(
    by_id: &HashMap<Uuid, ClientMessage>,
    confirmed: &ClientMessage,
    options: ReconcileOptions,
) -> Option<Uuid> {
    let candidates = || by_id.values().filter(|m| m.temporary);

    if let Some(found) = candidates().find(|m| correlates(confirmed, m)) {
        return Some(found.id);
    }

    if !options.heuristic {
        return None;
    }

    candidates()
        .filter_map(|m| heuristic_gap(confirmed, m, options.window).map(|gap| (gap, m.id)))
        .min()
        .map(|(_, id)| id)
}

fn stands_for(confirmed: &ClientMessage, optimistic: &ClientMessage, options: ReconcileOptions) -> bool {
    correlates(confirmed, optimistic)
        || (options.heuristic && heuristic_gap(confirmed, optimistic, options.window).is_some())
}

fn correlates(confirmed: &ClientMessage, optimistic: &ClientMessage) -> bool {
    confirmed
        .client_message_id
        .is_some_and(|c| optimistic.client_message_id == Some(c) || optimistic.id == c)
}

/// Timestamp distance between a confirmed entry and an optimistic one that
/// looks like the same send. Only applies when the server echoed no
/// correlation id, since an echoed id is authoritative.
fn heuristic_gap(confirmed: &ClientMessage, optimistic: &ClientMessage, window: Duration) -> Option<Duration> {
    if confirmed.client_message_id.is_some()
        || optimistic.sender_id != confirmed.sender_id
        || optimistic.receiver_id != confirmed.receiver_id
        || optimistic.kind != confirmed.kind
        || optimistic.content != confirmed.content
        || optimistic.group_id.is_some_and(|g| Some(g) != confirmed.group_id)
    {
        return None;
    }
    let gap = (optimistic.sort_key()? - confirmed.sort_key()?).unsigned_abs();
    (gap <= window).then_some(gap)
}

/// Shallow merge of a newer confirmed copy into a held one. Server fields are
/// replaced; lifecycle flags only ever turn on; local metadata keys survive.
fn merge_fields(existing: &mut ClientMessage, incoming: &ClientMessage) {
    let delivered = existing.delivered || incoming.delivered;
    let read = existing.read || incoming.read;
    let edited = existing.edited || incoming.edited;
    let deleted = existing.deleted || incoming.deleted;
    let delivered_at = incoming.delivered_at.or(existing.delivered_at);
    let read_at = incoming.read_at.or(existing.read_at);
    let local_timestamp = existing.local_timestamp.or(incoming.local_timestamp);

    let mut metadata = std::mem::replace(&mut existing.metadata, Value::Null);
    merge_metadata(&mut metadata, &incoming.metadata, true);

    *existing = incoming.clone();
    existing.metadata = metadata;
    existing.delivered = delivered || read;
    existing.read = read;
    existing.edited = edited;
    existing.deleted = deleted;
    existing.delivered_at = delivered_at;
    existing.read_at = read_at;
    existing.local_timestamp = local_timestamp;
}

/// Copies keys from `other` into `target`. With `overwrite` unset, keys already
/// in `target` are kept.
fn merge_metadata(target: &mut Value, other: &Value, overwrite: bool) {
    let Some(other) = other.as_object() else { return };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Some(target) = target.as_object_mut() {
        for (key, value) in other {
            if overwrite || !target.contains_key(key) {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::MessageKind;
    use serde_json::json;
    use time::OffsetDateTime;

    fn confirmed(sender: Uuid, receiver: Uuid, content: &str, at: OffsetDateTime) -> ClientMessage {
        let mut message = ClientMessage::optimistic(sender, Some(receiver), MessageKind::Text, content, at);
        message.id = Uuid::now_v7();
        message.client_message_id = None;
        message.timestamp = Some(at);
        message.local_timestamp = None;
        message.temporary = false;
        message
    }

    #[test]
    fn test_heuristic_promotes_optimistic_within_window() {
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        let t = OffsetDateTime::now_utc();
        let optimistic = ClientMessage::optimistic(s, Some(r), MessageKind::Text, "hi", t);
        let server = confirmed(s, r, "hi", t + time::Duration::seconds(3));

        let merged = merge(&[optimistic], std::slice::from_ref(&server), ReconcileOptions::default());

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, server.id);
        assert!(!merged[0].temporary);
    }

    #[test]
    fn test_heuristic_ignores_matches_outside_window() {
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        let t = OffsetDateTime::now_utc();
        let optimistic = ClientMessage::optimistic(s, Some(r), MessageKind::Text, "hi", t);
        let server = confirmed(s, r, "hi", t + time::Duration::seconds(11));

        let merged = merge(&[optimistic], &[server], ReconcileOptions::default());
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_heuristic_can_be_disabled() {
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        let t = OffsetDateTime::now_utc();
        let optimistic = ClientMessage::optimistic(s, Some(r), MessageKind::Text, "hi", t);
        let server = confirmed(s, r, "hi", t + time::Duration::seconds(1));

        let options = ReconcileOptions { heuristic: false, ..Default::default() };
        assert_eq!(merge(&[optimistic], &[server], options).len(), 2);
    }

    #[test]
    fn test_correlation_id_wins_over_content() {
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        let t = OffsetDateTime::now_utc();
        let optimistic = ClientMessage::optimistic(s, Some(r), MessageKind::Text, "draft", t);
        let mut server = confirmed(s, r, "edited before echo", t + time::Duration::minutes(5));
        server.client_message_id = optimistic.client_message_id;

        let options = ReconcileOptions { heuristic: false, ..Default::default() };
        let merged = merge(&[optimistic], std::slice::from_ref(&server), options);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, server.id);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        let t = OffsetDateTime::now_utc();
        let mut optimistic = ClientMessage::optimistic(s, Some(r), MessageKind::Text, "hi", t);
        optimistic.metadata = json!({"upload_progress": 100});
        let current = vec![optimistic, confirmed(r, s, "earlier", t - time::Duration::seconds(30))];
        let incoming = vec![
            confirmed(s, r, "hi", t + time::Duration::seconds(2)),
            confirmed(r, s, "later", t + time::Duration::seconds(40)),
        ];

        let once = merge(&current, &incoming, ReconcileOptions::default());
        let twice = merge(&once, &incoming, ReconcileOptions::default());

        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
        assert_eq!(once[1].metadata["upload_progress"], 100);

        // The optimistic copy and its confirmation arriving in one batch.
        let optimistic = ClientMessage::optimistic(s, Some(r), MessageKind::Text, "again", t);
        let mut echoed = confirmed(s, r, "again", t + time::Duration::seconds(1));
        echoed.client_message_id = optimistic.client_message_id;
        for batch in [vec![optimistic.clone(), echoed.clone()], vec![echoed.clone(), optimistic.clone()]] {
            let once = merge(&[], &batch, ReconcileOptions::default());
            let twice = merge(&once, &batch, ReconcileOptions::default());
            assert_eq!(once, twice);
            assert_eq!(once.len(), 1);
            assert_eq!(once[0].id, echoed.id);
        }

        // Same, matched by content instead of a correlation id.
        let optimistic = ClientMessage::optimistic(s, Some(r), MessageKind::Text, "fuzzy", t);
        let server = confirmed(s, r, "fuzzy", t + time::Duration::seconds(1));
        let batch = vec![optimistic, server.clone()];
        let once = merge(&[], &batch, ReconcileOptions::default());
        let twice = merge(&once, &batch, ReconcileOptions::default());
        assert_eq!(once, twice);
        assert_eq!(once.len(), 1);
        assert_eq!(once[0].id, server.id);
    }

    #[test]
    fn test_replayed_optimistic_is_not_duplicated() {
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        let optimistic = ClientMessage::optimistic(s, Some(r), MessageKind::Text, "hi", OffsetDateTime::now_utc());

        let merged = merge(&[optimistic.clone()], &[optimistic.clone(), optimistic], ReconcileOptions::default());
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_update_keeps_sticky_flags_and_local_metadata() {
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        let t = OffsetDateTime::now_utc();
        let mut held = confirmed(s, r, "hi", t);
        held.read = true;
        held.read_at = Some(t);
        held.metadata = json!({"caption": "local"});

        let mut stale = held.clone();
        stale.read = false;
        stale.read_at = None;
        stale.delivered = true;
        stale.metadata = json!({});

        let merged = merge(&[held], &[stale], ReconcileOptions::default());
        assert!(merged[0].read && merged[0].delivered);
        assert_eq!(merged[0].read_at, Some(t));
        assert_eq!(merged[0].metadata["caption"], "local");
    }

    #[test]
    fn test_output_sorted_with_untimed_last() {
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        let t = OffsetDateTime::now_utc();
        let mut untimed = ClientMessage::optimistic(s, Some(r), MessageKind::Text, "?", t);
        untimed.local_timestamp = None;
        let late = confirmed(s, r, "b", t + time::Duration::seconds(5));
        let early = confirmed(s, r, "a", t);

        let merged = merge(&[], &[untimed.clone(), late.clone(), early.clone()], ReconcileOptions::default());
        let ids: Vec<Uuid> = merged.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![early.id, late.id, untimed.id]);
    }

    #[test]
    fn test_update_for_unknown_message_is_noop() {
        let (s, r) = (Uuid::new_v4(), Uuid::new_v4());
        let t = OffsetDateTime::now_utc();
        let mut held = vec![confirmed(s, r, "hi", t)];
        let before = held.clone();

        assert!(!apply_update(&mut held, &confirmed(s, r, "gone", t)));
        assert_eq!(held, before);
    }
}
