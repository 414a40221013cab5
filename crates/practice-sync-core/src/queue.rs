//! Offline queue for outbound mutations.
//!
//! Mutations made while disconnected are buffered here and mirrored to the
//! key/value store so they survive restarts. The queue is bounded:
//! - one event per `(kind, entity key)`, newest timestamp wins
//! - events older than the TTL are dropped
//! - beyond capacity, only the most recent events are kept
//!
//! The persisted copy may be written by other contexts, so every enqueue and
//! every flush reloads it first.

use crate::clock::{format_timestamp, parse_timestamp};
use crate::protocol::{EventKind, SyncEvent};
use crate::store::{KeyValueStore, load_json, save_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A queued mutation and when it was queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEvent {
    pub event: SyncEvent,
    pub queued_at: String,
}

impl QueuedEvent {
    pub fn new(event: SyncEvent, now: DateTime<Utc>) -> Self {
        Self {
            event,
            queued_at: format_timestamp(now),
        }
    }

    /// Ordering instant: the event timestamp, or the enqueue time when the
    /// event timestamp does not parse.
    fn instant(&self) -> Option<DateTime<Utc>> {
        self.event
            .timestamp_instant()
            .or_else(|| parse_timestamp(&self.queued_at))
    }
}

/// Bounds applied on every queue mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(48 * 3600),
            capacity: 200,
        }
    }
}

/// Deduplicate and bound a queue, preserving enqueue order of survivors.
pub fn prune(events: Vec<QueuedEvent>, policy: &QueuePolicy, now: DateTime<Utc>) -> Vec<QueuedEvent> {
    // Newest per (kind, entity key); ties go to the later enqueue.
    let mut newest: HashMap<(EventKind, String), usize> = HashMap::new();
    for (index, queued) in events.iter().enumerate() {
        let Some(key) = queued.event.entity_key() else {
            continue;
        };
        let group = (queued.event.kind, key);
        match newest.get(&group) {
            Some(&best) if events[best].instant() > queued.instant() => {}
            _ => {
                newest.insert(group, index);
            }
        }
    }
    let deduped: HashSet<usize> = newest.into_values().collect();

    let ttl = chrono::Duration::from_std(policy.ttl).unwrap_or(chrono::Duration::MAX);
    let mut kept: Vec<(usize, QueuedEvent)> = events
        .into_iter()
        .enumerate()
        .filter(|(index, _)| deduped.contains(index))
        .filter(|(_, queued)| match queued.instant() {
            Some(instant) => now.signed_duration_since(instant) <= ttl,
            // Undatable events are kept rather than silently lost
            None => true,
        })
        .collect();

    if kept.len() > policy.capacity {
        let mut by_recency: Vec<(usize, Option<DateTime<Utc>>)> =
            kept.iter().map(|(index, queued)| (*index, queued.instant())).collect();
        by_recency.sort_by_key(|(_, instant)| Reverse(*instant));
        let recent: HashSet<usize> = by_recency
            .into_iter()
            .take(policy.capacity)
            .map(|(index, _)| index)
            .collect();
        kept.retain(|(index, _)| recent.contains(index));
    }

    kept.into_iter().map(|(_, queued)| queued).collect()
}

/// Persistent FIFO of mutations awaiting a connection.
pub struct OutboundQueue {
    store: Arc<dyn KeyValueStore>,
    key: String,
    policy: QueuePolicy,
    events: Vec<QueuedEvent>,
}

impl OutboundQueue {
    /// Create a queue backed by `key` in the store, loading whatever is persisted.
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>, policy: QueuePolicy) -> Self {
        let mut queue = Self {
            store,
            key: key.into(),
            policy,
            events: Vec::new(),
        };
        queue.reload();
        queue
    }

    /// Replace the in-memory copy with the persisted queue.
    pub fn reload(&mut self) {
        self.events = load_json(self.store.as_ref(), &self.key).unwrap_or_default();
    }

    /// Queue a mutation for later delivery.
    ///
    /// Returns `false` when the event is not eligible: control events are not
    /// safe to replay, and events without an entity key cannot be deduplicated.
    pub fn enqueue(&mut self, event: SyncEvent, now: DateTime<Utc>) -> bool {
        if !event.kind.is_mutation() {
            debug!("Dropping {} while offline (not a mutation)", event.kind);
            return false;
        }
        if event.entity_key().is_none() {
            debug!("Dropping {} while offline (no entity key)", event.kind);
            return false;
        }

        self.reload();
        self.events.push(QueuedEvent::new(event, now));
        let events = std::mem::take(&mut self.events);
        self.events = prune(events, &self.policy, now);
        self.persist();
        true
    }

    /// Reload, then hand over every queued event in enqueue order, clearing
    /// both the in-memory and persisted copies before the caller sends them.
    pub fn take_all(&mut self) -> Vec<SyncEvent> {
        self.reload();
        if self.events.is_empty() {
            return Vec::new();
        }
        let events = std::mem::take(&mut self.events);
        self.persist();
        events.into_iter().map(|queued| queued.event).collect()
    }

    /// Drop every queued event.
    pub fn clear(&mut self) {
        self.events.clear();
        self.persist();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[QueuedEvent] {
        &self.events
    }

    fn persist(&self) {
        let result = if self.events.is_empty() {
            self.store.remove(&self.key)
        } else {
            save_json(self.store.as_ref(), &self.key, &self.events)
        };
        if let Err(e) = result {
            warn!("Failed to persist offline queue: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Record;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    const KEY: &str = "test.offline_queue";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap()
    }

    fn at(minutes_ago: i64) -> String {
        format_timestamp(now() - chrono::Duration::minutes(minutes_ago))
    }

    fn update(id: &str, timestamp: String) -> SyncEvent {
        SyncEvent::entry(EventKind::EntryUpdated, Record::new(id), timestamp)
    }

    fn queue_on(store: &MemoryStore) -> OutboundQueue {
        OutboundQueue::new(Arc::new(store.clone()), KEY, QueuePolicy::default())
    }

    // ==================== Eligibility ====================

    #[test]
    fn test_control_events_are_not_queued() {
        let store = MemoryStore::new();
        let mut queue = queue_on(&store);

        assert!(!queue.enqueue(SyncEvent::ping(now()), now()));
        let mut bulk = SyncEvent::new(EventKind::BulkSync, at(1));
        bulk.entries = Some(vec![Record::new("e1")]);
        assert!(!queue.enqueue(bulk, now()));

        assert!(queue.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_keyless_mutation_is_not_queued() {
        let store = MemoryStore::new();
        let mut queue = queue_on(&store);

        assert!(!queue.enqueue(SyncEvent::new(EventKind::EntryUpdated, at(1)), now()));
        assert!(queue.is_empty());
    }

    // ==================== Dedup / TTL / cap ====================

    #[test]
    fn test_dedup_keeps_latest_timestamp() {
        let store = MemoryStore::new();
        let mut queue = queue_on(&store);

        queue.enqueue(update("e1", at(5)), now());
        queue.enqueue(update("e1", at(1)), now());
        // An older edit arriving late must not win
        queue.enqueue(update("e1", at(10)), now());

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.events()[0].event.timestamp, at(1));
    }

    #[test]
    fn test_dedup_is_per_kind() {
        let store = MemoryStore::new();
        let mut queue = queue_on(&store);

        queue.enqueue(SyncEvent::entry(EventKind::EntryCreated, Record::new("e1"), at(3)), now());
        queue.enqueue(update("e1", at(2)), now());
        queue.enqueue(SyncEvent::entry_deleted("e1", at(1)), now());

        let kinds: Vec<_> = queue.events().iter().map(|q| q.event.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::EntryCreated, EventKind::EntryUpdated, EventKind::EntryDeleted]
        );
    }

    #[test]
    fn test_ttl_drops_stale_events() {
        let store = MemoryStore::new();
        let mut queue = queue_on(&store);

        let stale = format_timestamp(now() - chrono::Duration::hours(48) - chrono::Duration::seconds(1));
        let edge = format_timestamp(now() - chrono::Duration::hours(48));
        queue.enqueue(update("old", stale), now());
        queue.enqueue(update("edge", edge), now());
        queue.enqueue(update("fresh", at(1)), now());

        let keys: Vec<_> = queue.events().iter().filter_map(|q| q.event.entity_key()).collect();
        assert_eq!(keys, vec!["edge".to_string(), "fresh".to_string()]);
    }

    #[test]
    fn test_unparsable_timestamp_ages_from_queue_time() {
        let mut events = vec![QueuedEvent::new(update("e1", "garbage".into()), now())];
        let policy = QueuePolicy::default();

        assert_eq!(prune(events.clone(), &policy, now()).len(), 1);

        events[0].queued_at = format_timestamp(now() - chrono::Duration::hours(49));
        assert!(prune(events, &policy, now()).is_empty());
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let policy = QueuePolicy::default();
        // e0 is the oldest, e249 the newest; enqueue newest first to prove
        // selection is by timestamp rather than position
        let events: Vec<_> = (0..250)
            .rev()
            .map(|i| QueuedEvent::new(update(&format!("e{i}"), at(250 - i)), now()))
            .collect();

        let kept = prune(events, &policy, now());

        assert_eq!(kept.len(), 200);
        let ids: HashSet<_> = kept.iter().filter_map(|q| q.event.entity_key()).collect();
        for i in 50..250 {
            assert!(ids.contains(&format!("e{i}")), "e{i} should survive");
        }
        // Survivors keep their enqueue order
        assert_eq!(kept[0].event.entity_key().as_deref(), Some("e249"));
        assert_eq!(kept[199].event.entity_key().as_deref(), Some("e50"));
    }

    // ==================== Persistence ====================

    #[test]
    fn test_queue_survives_restart() {
        let store = MemoryStore::new();
        {
            let mut queue = queue_on(&store);
            queue.enqueue(update("e1", at(2)), now());
            queue.enqueue(update("e2", at(1)), now());
        }

        let queue = queue_on(&store);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.events()[0].event.entity_key().as_deref(), Some("e1"));
    }

    #[test]
    fn test_enqueue_merges_other_context_writes() {
        let store = MemoryStore::new();
        let mut tab_a = queue_on(&store);
        let mut tab_b = queue_on(&store);

        tab_a.enqueue(update("e1", at(3)), now());
        tab_b.enqueue(update("e2", at(2)), now());
        tab_a.enqueue(update("e3", at(1)), now());

        tab_b.reload();
        assert_eq!(tab_a.len(), 3);
        assert_eq!(tab_b.len(), 3);
    }

    #[test]
    fn test_take_all_clears_before_returning() {
        let store = MemoryStore::new();
        let mut queue = queue_on(&store);
        queue.enqueue(update("a", at(3)), now());
        queue.enqueue(update("b", at(2)), now());
        queue.enqueue(update("c", at(1)), now());

        let taken = queue.take_all();

        let ids: Vec<_> = taken.iter().filter_map(SyncEvent::entity_key).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
        assert_eq!(store.get(KEY).unwrap(), None);
        assert!(queue.take_all().is_empty());
    }

    #[test]
    fn test_take_all_sees_other_context_writes() {
        let store = MemoryStore::new();
        let mut flusher = queue_on(&store);
        let mut other = queue_on(&store);

        other.enqueue(update("e9", at(1)), now());

        assert_eq!(flusher.take_all().len(), 1);
    }

    #[test]
    fn test_corrupt_persisted_queue_is_empty() {
        let store = MemoryStore::new();
        store.set(KEY, "[{\"broken\"").unwrap();

        let queue = queue_on(&store);
        assert!(queue.is_empty());
        assert_eq!(store.get(KEY).unwrap(), None);
    }

    #[test]
    fn test_persisted_format_wraps_queue_time() {
        let store = MemoryStore::new();
        let mut queue = queue_on(&store);
        queue.enqueue(update("e1", at(1)), now());

        let raw: serde_json::Value = serde_json::from_str(&store.get(KEY).unwrap().unwrap()).unwrap();
        assert_eq!(raw[0]["event"]["kind"], "ENTRY_UPDATED");
        assert_eq!(raw[0]["queuedAt"], format_timestamp(now()));
    }
}
