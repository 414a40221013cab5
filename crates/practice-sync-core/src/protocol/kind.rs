//! Event kind tags and subscription topics.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown event kind: {0}")]
pub struct UnknownKind(pub String);

/// The `kind` tag carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    EntryCreated,
    EntryUpdated,
    EntryDeleted,
    PieceAdded,
    PieceUpdated,
    PieceRemoved,
    PieceDissociated,
    BulkSync,
    RepertoireBulkSync,
    SyncRequest,
    SyncResponse,
    ConflictDetected,
    Ping,
    Pong,
    Welcome,
}

impl EventKind {
    /// Every kind, in wire-table order.
    pub const ALL: [EventKind; 15] = [
        EventKind::EntryCreated,
        EventKind::EntryUpdated,
        EventKind::EntryDeleted,
        EventKind::PieceAdded,
        EventKind::PieceUpdated,
        EventKind::PieceRemoved,
        EventKind::PieceDissociated,
        EventKind::BulkSync,
        EventKind::RepertoireBulkSync,
        EventKind::SyncRequest,
        EventKind::SyncResponse,
        EventKind::ConflictDetected,
        EventKind::Ping,
        EventKind::Pong,
        EventKind::Welcome,
    ];

    /// Wire representation of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EntryCreated => "ENTRY_CREATED",
            EventKind::EntryUpdated => "ENTRY_UPDATED",
            EventKind::EntryDeleted => "ENTRY_DELETED",
            EventKind::PieceAdded => "PIECE_ADDED",
            EventKind::PieceUpdated => "PIECE_UPDATED",
            EventKind::PieceRemoved => "PIECE_REMOVED",
            EventKind::PieceDissociated => "PIECE_DISSOCIATED",
            EventKind::BulkSync => "BULK_SYNC",
            EventKind::RepertoireBulkSync => "REPERTOIRE_BULK_SYNC",
            EventKind::SyncRequest => "SYNC_REQUEST",
            EventKind::SyncResponse => "SYNC_RESPONSE",
            EventKind::ConflictDetected => "CONFLICT_DETECTED",
            EventKind::Ping => "PING",
            EventKind::Pong => "PONG",
            EventKind::Welcome => "WELCOME",
        }
    }

    /// Durable data changes to a single record. Only these are safe to queue
    /// and replay after a disconnect.
    pub fn is_mutation(&self) -> bool {
        self.is_entry_mutation() || self.is_piece_mutation()
    }

    /// Create/update/delete of a practice log entry.
    pub fn is_entry_mutation(&self) -> bool {
        matches!(
            self,
            EventKind::EntryCreated | EventKind::EntryUpdated | EventKind::EntryDeleted
        )
    }

    /// Piece-level repertoire changes.
    pub fn is_piece_mutation(&self) -> bool {
        matches!(
            self,
            EventKind::PieceAdded
                | EventKind::PieceUpdated
                | EventKind::PieceRemoved
                | EventKind::PieceDissociated
        )
    }

    /// Events whose arrival proves we are caught up to their timestamp.
    pub fn is_data_carrying(&self) -> bool {
        self.is_mutation() || matches!(self, EventKind::BulkSync | EventKind::RepertoireBulkSync)
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// What a handler subscribes to: one exact kind, or every event (`"*"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Kind(EventKind),
    Wildcard,
}

impl From<EventKind> for Topic {
    fn from(kind: EventKind) -> Self {
        Topic::Kind(kind)
    }
}

impl FromStr for Topic {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            Ok(Topic::Wildcard)
        } else {
            s.parse().map(Topic::Kind)
        }
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Kind(kind) => kind.fmt(f),
            Topic::Wildcard => f.write_str("*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_matches_as_str() {
        for kind in EventKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let parsed: EventKind = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_from_str() {
        assert_eq!("PIECE_DISSOCIATED".parse(), Ok(EventKind::PieceDissociated));
        assert_eq!(
            "entry_created".parse::<EventKind>(),
            Err(UnknownKind("entry_created".into()))
        );
    }

    #[test]
    fn test_classification() {
        let mutations: Vec<_> = EventKind::ALL.into_iter().filter(EventKind::is_mutation).collect();
        assert_eq!(mutations.len(), 7);

        assert!(EventKind::BulkSync.is_data_carrying());
        assert!(EventKind::RepertoireBulkSync.is_data_carrying());
        assert!(!EventKind::BulkSync.is_mutation());

        for control in [
            EventKind::Ping,
            EventKind::Pong,
            EventKind::Welcome,
            EventKind::SyncRequest,
            EventKind::SyncResponse,
            EventKind::ConflictDetected,
        ] {
            assert!(!control.is_data_carrying(), "{control} should not carry data");
        }
    }

    #[test]
    fn test_topic_parsing() {
        assert_eq!("*".parse(), Ok(Topic::Wildcard));
        assert_eq!("WELCOME".parse(), Ok(Topic::Kind(EventKind::Welcome)));
        assert!("".parse::<Topic>().is_err());
        assert_eq!(Topic::Wildcard.to_string(), "*");
    }
}
