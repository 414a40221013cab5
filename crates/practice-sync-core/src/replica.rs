//! Local replica of entries and repertoire pieces.
//!
//! The replica is the consuming side of the router: created events insert,
//! updated events go through [`resolve`], removals are unconditional, and bulk
//! syncs merge record by record. Its contents can be written to the backup
//! slots of a [`KeyValueStore`] and restored after a crash.

use crate::conflict::{Resolution, resolve};
use crate::protocol::{EventKind, Record, SyncEvent, Topic};
use crate::router::{EventRouter, HandlerId};
use crate::store::{BackupSlot, KeyValueStore, StoreKeys, load_json, save_json};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Counts from applying one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Records inserted, replaced, or removed.
    pub applied: usize,
    /// Inbound versions rejected because local was newer.
    pub discarded: usize,
}

impl ApplyOutcome {
    fn add(&mut self, other: ApplyOutcome) {
        self.applied += other.applied;
        self.discarded += other.discarded;
    }
}

/// In-memory view of the user's records.
#[derive(Debug, Clone, Default)]
pub struct Replica {
    entries: BTreeMap<String, Record>,
    pieces: BTreeMap<String, Record>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, id: &str) -> Option<&Record> {
        self.entries.get(id)
    }

    pub fn piece(&self, key: &str) -> Option<&Record> {
        self.pieces.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Record> {
        self.entries.values()
    }

    pub fn pieces(&self) -> impl Iterator<Item = &Record> {
        self.pieces.values()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Store a locally edited entry, bypassing conflict resolution.
    pub fn upsert_local_entry(&mut self, entry: Record) {
        self.entries.insert(entry.id.clone(), entry);
    }

    /// Store a locally edited piece, bypassing conflict resolution.
    pub fn upsert_local_piece(&mut self, piece: Record) {
        self.pieces.insert(piece.piece_key().to_string(), piece);
    }

    /// Apply an inbound event.
    pub fn apply(&mut self, event: &SyncEvent) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        match event.kind {
            EventKind::EntryCreated => {
                if let Some(entry) = &event.entry {
                    self.upsert_local_entry(entry.clone());
                    outcome.applied += 1;
                }
            }
            EventKind::EntryUpdated => {
                if let Some(entry) = &event.entry {
                    outcome.add(merge(&mut self.entries, entry.id.clone(), entry));
                }
            }
            EventKind::EntryDeleted => {
                if event
                    .entity_key()
                    .and_then(|id| self.entries.remove(&id))
                    .is_some()
                {
                    outcome.applied += 1;
                }
            }
            // Every piece arm keys by the event's scoreId when it carries one
            EventKind::PieceAdded => {
                if let (Some(key), Some(piece)) = (event.entity_key(), &event.piece) {
                    self.pieces.insert(key, piece.clone());
                    outcome.applied += 1;
                }
            }
            EventKind::PieceUpdated => {
                if let (Some(key), Some(piece)) = (event.entity_key(), &event.piece) {
                    outcome.add(merge(&mut self.pieces, key, piece));
                }
            }
            EventKind::PieceRemoved | EventKind::PieceDissociated => {
                if event
                    .entity_key()
                    .and_then(|key| self.pieces.remove(&key))
                    .is_some()
                {
                    outcome.applied += 1;
                }
            }
            EventKind::BulkSync => {
                for entry in event.entries.iter().flatten() {
                    outcome.add(merge(&mut self.entries, entry.id.clone(), entry));
                }
            }
            EventKind::RepertoireBulkSync => {
                for piece in event.pieces.iter().flatten() {
                    outcome.add(merge(&mut self.pieces, piece.piece_key().to_string(), piece));
                }
            }
            _ => {}
        }

        if outcome.discarded > 0 {
            debug!(
                "Kept {} newer local record(s) over {}",
                outcome.discarded, event.kind
            );
        }
        outcome
    }

    /// Write entries and pieces to their backup slots.
    pub fn backup(&self, store: &dyn KeyValueStore, keys: &StoreKeys) -> crate::store::Result<()> {
        let entries: Vec<&Record> = self.entries.values().collect();
        let pieces: Vec<&Record> = self.pieces.values().collect();
        save_json(store, &keys.backup(BackupSlot::Entries), &entries)?;
        save_json(store, &keys.backup(BackupSlot::Pieces), &pieces)?;
        info!(
            "Backed up {} entries and {} pieces",
            entries.len(),
            pieces.len()
        );
        Ok(())
    }

    /// Rebuild a replica from the backup slots. Missing or corrupt slots
    /// restore as empty.
    pub fn restore(store: &dyn KeyValueStore, keys: &StoreKeys) -> Self {
        let mut replica = Self::new();
        let entries: Vec<Record> =
            load_json(store, &keys.backup(BackupSlot::Entries)).unwrap_or_default();
        let pieces: Vec<Record> =
            load_json(store, &keys.backup(BackupSlot::Pieces)).unwrap_or_default();
        for entry in entries {
            replica.upsert_local_entry(entry);
        }
        for piece in pieces {
            replica.upsert_local_piece(piece);
        }
        replica
    }

    /// Subscribe a shared replica to every routed event.
    pub fn attach(replica: Arc<Mutex<Replica>>, router: &EventRouter) -> HandlerId {
        router.on(Topic::Wildcard, move |event: &SyncEvent| {
            replica
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .apply(event);
            Ok(())
        })
    }
}

fn merge(records: &mut BTreeMap<String, Record>, key: String, incoming: &Record) -> ApplyOutcome {
    match resolve(records.get(&key), incoming) {
        Resolution::ApplyRemote => {
            records.insert(key, incoming.clone());
            ApplyOutcome {
                applied: 1,
                discarded: 0,
            }
        }
        Resolution::KeepLocal => ApplyOutcome {
            applied: 0,
            discarded: 1,
        },
    }
}

/// Read a backup slot the replica does not manage (goals, metadata).
pub fn load_raw_backup(store: &dyn KeyValueStore, keys: &StoreKeys, slot: BackupSlot) -> Option<Value> {
    load_json(store, &keys.backup(slot))
}

/// Write a backup slot the replica does not manage.
pub fn save_raw_backup(
    store: &dyn KeyValueStore,
    keys: &StoreKeys,
    slot: BackupSlot,
    value: &Value,
) -> crate::store::Result<()> {
    save_json(store, &keys.backup(slot), value)
}
