//! Sync cursor bookkeeping and the catch-up decision.
//!
//! Two scalars are persisted independently:
//! - `last_sync_time`: timestamp of the newest data-carrying event accepted
//! - `last_seq`: highest server sequence number observed, never written backwards

use crate::clock::{format_timestamp, parse_timestamp};
use crate::protocol::SyncEvent;
use crate::store::{KeyValueStore, StoreKeys, load_json, save_json};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Tracks the sync cursor across connections and restarts.
#[derive(Clone)]
pub struct SyncStateTracker {
    store: Arc<dyn KeyValueStore>,
    keys: StoreKeys,
}

impl SyncStateTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: StoreKeys) -> Self {
        Self { store, keys }
    }

    /// Highest sequence number seen so far, 0 if none.
    pub fn last_seq(&self) -> u64 {
        load_json(self.store.as_ref(), &self.keys.last_seq()).unwrap_or(0)
    }

    /// Timestamp of the last accepted data-carrying event, as stored.
    pub fn last_sync_time(&self) -> Option<String> {
        load_json(self.store.as_ref(), &self.keys.last_sync_time())
    }

    /// Raise `last_seq` to `seq` if it is strictly greater. Returns whether
    /// the stored value changed.
    pub fn advance_seq(&self, seq: u64) -> bool {
        let current = self.last_seq();
        if seq <= current {
            return false;
        }
        if let Err(e) = save_json(self.store.as_ref(), &self.keys.last_seq(), &seq) {
            warn!("Failed to persist last_seq {}: {}", seq, e);
            return false;
        }
        debug!("Advanced last_seq {} -> {}", current, seq);
        true
    }

    /// Record the sync point, clamping invalid or future timestamps to `now`.
    /// Returns the value stored.
    pub fn record_sync_time(&self, timestamp: &str, now: DateTime<Utc>) -> String {
        let recorded = match parse_timestamp(timestamp) {
            Some(instant) if instant <= now => timestamp.to_string(),
            Some(_) => {
                debug!("Clamping future sync timestamp {}", timestamp);
                format_timestamp(now)
            }
            None => {
                debug!("Clamping unparsable sync timestamp {:?}", timestamp);
                format_timestamp(now)
            }
        };
        if let Err(e) = save_json(self.store.as_ref(), &self.keys.last_sync_time(), &recorded) {
            warn!("Failed to persist last_sync_time: {}", e);
        }
        recorded
    }

    /// Update bookkeeping for an accepted inbound event.
    pub fn observe(&self, event: &SyncEvent, now: DateTime<Utc>) {
        if let Some(position) = event.cursor_position() {
            self.advance_seq(position);
        }
        if event.kind.is_data_carrying() {
            self.record_sync_time(&event.timestamp, now);
        }
    }

    /// Decide whether a fresh connection needs a catch-up request.
    ///
    /// A request is built when the last sync time is missing, unparsable, in
    /// the future, or older than `threshold`, or when mutations are still
    /// queued. The cursor fields are omitted when they carry no information.
    pub fn catch_up_request(
        &self,
        queue_pending: bool,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Option<SyncEvent> {
        let last_sync = self.last_sync_time();
        let valid_since = last_sync
            .as_deref()
            .and_then(parse_timestamp)
            .and_then(|instant| now.signed_duration_since(instant).to_std().ok());

        let needed = match valid_since {
            Some(elapsed) => elapsed > threshold || queue_pending,
            None => true,
        };
        if !needed {
            return None;
        }

        let last_seq = Some(self.last_seq()).filter(|&seq| seq > 0);
        let last_sync_time = valid_since.and(last_sync);
        Some(SyncEvent::sync_request(last_sync_time, last_seq, now))
    }

    /// Forget both cursors.
    pub fn reset(&self) {
        for key in [self.keys.last_seq(), self.keys.last_sync_time()] {
            if let Err(e) = self.store.remove(&key) {
                warn!("Failed to clear {}: {}", key, e);
            }
        }
    }
}
