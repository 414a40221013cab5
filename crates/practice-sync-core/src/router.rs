//! Inbound event routing.
//!
//! Raw frames are parsed into [`SyncEvent`]s, recorded with the
//! [`SyncStateTracker`], then dispatched through a table of handlers:
//! handlers for the exact kind run first, then wildcard handlers, each list
//! in registration order.
//!
//! Handler failures are isolated: an `Err` or a panic is logged and the
//! remaining handlers still run.

use crate::cursor::SyncStateTracker;
use crate::protocol::{EventKind, SyncEvent, Topic};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

/// Callback invoked for each routed event.
pub type Handler = Arc<dyn Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync>;

/// Identifies a registration so it can be removed with [`EventRouter::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

#[derive(Default)]
struct DispatchTable {
    by_kind: HashMap<EventKind, Vec<(HandlerId, Handler)>>,
    wildcard: Vec<(HandlerId, Handler)>,
}

impl DispatchTable {
    fn list_mut(&mut self, topic: Topic) -> &mut Vec<(HandlerId, Handler)> {
        match topic {
            Topic::Kind(kind) => self.by_kind.entry(kind).or_default(),
            Topic::Wildcard => &mut self.wildcard,
        }
    }
}

/// Parses inbound frames and fans them out to subscribers.
pub struct EventRouter {
    tracker: SyncStateTracker,
    table: RwLock<DispatchTable>,
    next_id: AtomicUsize,
}

impl EventRouter {
    pub fn new(tracker: SyncStateTracker) -> Self {
        Self {
            tracker,
            table: RwLock::new(DispatchTable::default()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Cursor tracker updated by every routed event.
    pub fn tracker(&self) -> &SyncStateTracker {
        &self.tracker
    }

    /// Register a handler for a kind, or for every event with [`Topic::Wildcard`].
    pub fn on(
        &self,
        topic: impl Into<Topic>,
        handler: impl Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.table
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .list_mut(topic.into())
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a registration. Returns `false` if it was not registered under `topic`.
    pub fn off(&self, topic: impl Into<Topic>, id: HandlerId) -> bool {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        let list = table.list_mut(topic.into());
        let before = list.len();
        list.retain(|(registered, _)| *registered != id);
        list.len() != before
    }

    /// Number of handlers registered for a topic.
    pub fn handler_count(&self, topic: impl Into<Topic>) -> usize {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        match topic.into() {
            Topic::Kind(kind) => table.by_kind.get(&kind).map_or(0, Vec::len),
            Topic::Wildcard => table.wildcard.len(),
        }
    }

    /// Handle one raw inbound frame.
    ///
    /// Malformed frames are logged and dropped. Returns the parsed event when
    /// it was accepted.
    pub fn handle_frame(&self, frame: &str) -> Option<SyncEvent> {
        self.handle_frame_at(frame, Utc::now())
    }

    /// [`handle_frame`](Self::handle_frame) with an explicit clock.
    pub fn handle_frame_at(&self, frame: &str, now: DateTime<Utc>) -> Option<SyncEvent> {
        let event = match SyncEvent::parse(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping inbound frame ({} bytes): {}", frame.len(), e);
                return None;
            }
        };

        self.tracker.observe(&event, now);
        let delivered = self.dispatch(&event);
        debug!("Routed {} to {} handler(s)", event.kind, delivered);
        Some(event)
    }

    /// Deliver an event to its handlers. Returns how many handlers ran to
    /// completion without error.
    pub fn dispatch(&self, event: &SyncEvent) -> usize {
        // Snapshot the handler list so handlers may subscribe or unsubscribe.
        let handlers: Vec<Handler> = {
            let table = self.table.read().unwrap_or_else(|e| e.into_inner());
            table
                .by_kind
                .get(&event.kind)
                .into_iter()
                .flatten()
                .chain(table.wildcard.iter())
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        let mut succeeded = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => error!("Handler for {} failed: {:#}", event.kind, e),
                Err(_) => error!("Handler for {} panicked", event.kind),
            }
        }
        succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Record;
    use crate::store::{MemoryStore, StoreKeys};
    use std::sync::Mutex;

    fn router() -> EventRouter {
        let store = Arc::new(MemoryStore::new());
        EventRouter::new(SyncStateTracker::new(store, StoreKeys::default()))
    }

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        name: &'static str,
    ) -> impl Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static + use<> {
        let log = Arc::clone(log);
        move |event: &SyncEvent| {
            log.lock().unwrap().push(format!("{name}:{}", event.kind));
            Ok(())
        }
    }

    const ENTRY_FRAME: &str = r#"{"kind":"ENTRY_CREATED","timestamp":"2024-01-01T10:00:00Z","sequenceNumber":5,"entry":{"id":"e1"}}"#;

    // ==================== Dispatch order ====================

    #[test]
    fn test_exact_handlers_then_wildcard_in_order() {
        let router = router();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.on(Topic::Wildcard, recorder(&log, "any1"));
        router.on(EventKind::EntryCreated, recorder(&log, "exact1"));
        router.on(EventKind::EntryUpdated, recorder(&log, "other"));
        router.on(EventKind::EntryCreated, recorder(&log, "exact2"));
        router.on(Topic::Wildcard, recorder(&log, "any2"));

        router.handle_frame(ENTRY_FRAME).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "exact1:ENTRY_CREATED",
                "exact2:ENTRY_CREATED",
                "any1:ENTRY_CREATED",
                "any2:ENTRY_CREATED",
            ]
        );
    }

    #[test]
    fn test_off_removes_only_that_handler() {
        let router = router();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = router.on(EventKind::EntryCreated, recorder(&log, "first"));
        router.on(EventKind::EntryCreated, recorder(&log, "second"));

        assert!(!router.off(Topic::Wildcard, first));
        assert!(router.off(EventKind::EntryCreated, first));
        assert!(!router.off(EventKind::EntryCreated, first));
        assert_eq!(router.handler_count(EventKind::EntryCreated), 1);

        router.handle_frame(ENTRY_FRAME);
        assert_eq!(*log.lock().unwrap(), vec!["second:ENTRY_CREATED"]);
    }

    // ==================== Fault isolation ====================

    #[test]
    fn test_failing_handlers_do_not_stop_dispatch() {
        let router = router();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.on(EventKind::EntryCreated, |_| anyhow::bail!("store is full"));
        router.on(EventKind::EntryCreated, |_| panic!("handler bug"));
        router.on(EventKind::EntryCreated, recorder(&log, "survivor"));

        let event = SyncEvent::entry(EventKind::EntryCreated, Record::new("e1"), "2024-01-01T10:00:00Z");
        assert_eq!(router.dispatch(&event), 1);
        // Later events still flow
        assert_eq!(router.dispatch(&event), 1);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_handler_may_subscribe_during_dispatch() {
        let router = Arc::new(router());
        let inner = Arc::clone(&router);
        router.on(EventKind::Welcome, move |_| {
            inner.on(EventKind::Welcome, |_| Ok(()));
            Ok(())
        });

        router.handle_frame(r#"{"kind":"WELCOME"}"#);
        assert_eq!(router.handler_count(EventKind::Welcome), 2);
    }

    // ==================== Parsing and bookkeeping ====================

    #[test]
    fn test_malformed_frames_are_dropped() {
        let router = router();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.on(Topic::Wildcard, recorder(&log, "any"));

        assert!(router.handle_frame("{oops").is_none());
        assert!(router.handle_frame(r#"{"kind":"ENTRY_UPDATED"}"#).is_none());
        assert!(router.handle_frame(r#"{"kind":"WELCOME"}"#).is_some());

        assert_eq!(*log.lock().unwrap(), vec!["any:WELCOME"]);
    }

    #[test]
    fn test_routing_updates_cursors() {
        let router = router();
        router.handle_frame(ENTRY_FRAME);

        assert_eq!(router.tracker().last_seq(), 5);
        assert_eq!(
            router.tracker().last_sync_time().as_deref(),
            Some("2024-01-01T10:00:00Z")
        );
    }
}
