//! The `SyncEvent` wire message.

use super::kind::EventKind;
use super::record::Record;
use crate::clock::{format_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{0} event is missing its timestamp")]
    MissingTimestamp(EventKind),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A single JSON frame exchanged with the sync server.
///
/// Wire format:
/// `{"kind":"ENTRY_UPDATED","timestamp":"...","sequenceNumber":42,"entry":{...}}`
///
/// `type` is accepted in place of `kind` when parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    #[serde(alias = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    /// Cursor hint: the last sequence number the sender believes we have seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub piece: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pieces: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncEvent {
    /// Create a bare event with no payload.
    pub fn new(kind: EventKind, timestamp: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: timestamp.into(),
            sequence_number: None,
            last_seq: None,
            last_sync_time: None,
            entry: None,
            entries: None,
            entry_id: None,
            piece: None,
            pieces: None,
            score_id: None,
            user_id: None,
            message: None,
            error: None,
        }
    }

    /// Heartbeat frame.
    pub fn ping(now: DateTime<Utc>) -> Self {
        Self::new(EventKind::Ping, format_timestamp(now))
    }

    /// Catch-up request asking for everything after the given cursor.
    pub fn sync_request(
        last_sync_time: Option<String>,
        last_seq: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut event = Self::new(EventKind::SyncRequest, format_timestamp(now));
        event.last_sync_time = last_sync_time;
        event.last_seq = last_seq;
        event
    }

    /// Entry-level mutation (`ENTRY_CREATED` / `ENTRY_UPDATED`) carrying the record.
    pub fn entry(kind: EventKind, entry: Record, timestamp: impl Into<String>) -> Self {
        let mut event = Self::new(kind, timestamp);
        event.entry = Some(entry);
        event
    }

    /// `ENTRY_DELETED` carrying only the identifier.
    pub fn entry_deleted(entry_id: impl Into<String>, timestamp: impl Into<String>) -> Self {
        let mut event = Self::new(EventKind::EntryDeleted, timestamp);
        event.entry_id = Some(entry_id.into());
        event
    }

    /// Piece-level mutation carrying the record.
    pub fn piece(kind: EventKind, piece: Record, timestamp: impl Into<String>) -> Self {
        let mut event = Self::new(kind, timestamp);
        event.score_id = piece.score_id().map(str::to_string);
        event.piece = Some(piece);
        event
    }

    /// Piece-level mutation identified only by its score.
    pub fn piece_ref(kind: EventKind, score_id: impl Into<String>, timestamp: impl Into<String>) -> Self {
        let mut event = Self::new(kind, timestamp);
        event.score_id = Some(score_id.into());
        event
    }

    pub fn with_sequence_number(mut self, sequence_number: u64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    /// Parse and validate a raw frame.
    ///
    /// Mutation events must carry a non-empty timestamp: they take part in
    /// ordering and deduplication, control events do not.
    pub fn parse(frame: &str) -> Result<Self> {
        let event: SyncEvent = serde_json::from_str(frame)?;
        if event.kind.is_mutation() && event.timestamp.trim().is_empty() {
            return Err(ProtocolError::MissingTimestamp(event.kind));
        }
        Ok(event)
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The event's timestamp as an instant, if it parses.
    pub fn timestamp_instant(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    /// Identifier of the record this event mutates, used to deduplicate queued
    /// events. Entry events use the entry id; piece-level events use the score.
    /// Returns `None` for bulk and control events, and for mutations whose
    /// payload names no record.
    pub fn entity_key(&self) -> Option<String> {
        let key = if self.kind.is_entry_mutation() {
            self.entry
                .as_ref()
                .map(|entry| entry.id.as_str())
                .or(self.entry_id.as_deref())
        } else if self.kind.is_piece_mutation() {
            self.score_id
                .as_deref()
                .or_else(|| self.piece.as_ref().map(Record::piece_key))
        } else {
            None
        };
        key.filter(|k| !k.is_empty()).map(str::to_string)
    }

    /// Highest cursor position this event vouches for.
    pub fn cursor_position(&self) -> Option<u64> {
        match (self.sequence_number, self.last_seq) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    // ==================== Parsing ====================

    #[test]
    fn test_parse_entry_update() {
        let frame = r#"{
            "kind": "ENTRY_UPDATED",
            "timestamp": "2024-01-01T10:00:00Z",
            "sequenceNumber": 7,
            "entry": {"id": "e1", "updatedAt": "2024-01-01T10:00:00Z", "minutes": 20}
        }"#;
        let event = SyncEvent::parse(frame).unwrap();

        assert_eq!(event.kind, EventKind::EntryUpdated);
        assert_eq!(event.sequence_number, Some(7));
        assert_eq!(event.entry.as_ref().map(|e| e.id.as_str()), Some("e1"));
        assert_eq!(event.entity_key().as_deref(), Some("e1"));
    }

    #[test]
    fn test_parse_accepts_type_alias() {
        let event = SyncEvent::parse(r#"{"type":"WELCOME","userId":"u1"}"#).unwrap();
        assert_eq!(event.kind, EventKind::Welcome);
        assert_eq!(event.user_id.as_deref(), Some("u1"));
        assert!(event.timestamp.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            SyncEvent::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            SyncEvent::parse(r#"{"kind":"EXPLODE","timestamp":"x"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_mutation_without_timestamp() {
        let result = SyncEvent::parse(r#"{"kind":"ENTRY_DELETED","entryId":"e1"}"#);
        assert!(matches!(
            result,
            Err(ProtocolError::MissingTimestamp(EventKind::EntryDeleted))
        ));
    }

    // ==================== Serialization ====================

    #[test]
    fn test_to_json_omits_empty_fields() {
        let event = SyncEvent::entry_deleted("e1", "2024-01-01T10:00:00Z");
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["kind"], "ENTRY_DELETED");
        assert_eq!(value["entryId"], "e1");
        assert!(value.get("entry").is_none());
        assert!(value.get("sequenceNumber").is_none());
    }

    #[test]
    fn test_sync_request_fields() {
        let now = parse_timestamp("2024-01-01T10:00:00Z").unwrap();
        let event = SyncEvent::sync_request(Some("2024-01-01T09:00:00Z".into()), Some(12), now);
        let value: Value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["kind"], "SYNC_REQUEST");
        assert_eq!(value["lastSyncTime"], "2024-01-01T09:00:00Z");
        assert_eq!(value["lastSeq"], 12);
    }

    // ==================== Entity keys ====================

    #[test]
    fn test_entity_key_for_entries() {
        let with_record = SyncEvent::entry(EventKind::EntryCreated, Record::new("e1"), "t");
        assert_eq!(with_record.entity_key().as_deref(), Some("e1"));

        let by_id = SyncEvent::entry_deleted("e2", "t");
        assert_eq!(by_id.entity_key().as_deref(), Some("e2"));
    }

    #[test]
    fn test_entity_key_for_pieces_uses_score() {
        let piece = Record::new("p1").with_field("scoreId", "s1");
        let event = SyncEvent::piece(EventKind::PieceUpdated, piece, "t");
        assert_eq!(event.entity_key().as_deref(), Some("s1"));

        let removed = SyncEvent::piece_ref(EventKind::PieceRemoved, "s2", "t");
        assert_eq!(removed.entity_key().as_deref(), Some("s2"));

        let no_score = SyncEvent::piece(EventKind::PieceAdded, Record::new("p3"), "t");
        assert_eq!(no_score.entity_key().as_deref(), Some("p3"));
    }

    #[test]
    fn test_entity_key_absent() {
        let mut bulk = SyncEvent::new(EventKind::BulkSync, "t");
        bulk.entries = Some(vec![Record::new("e1")]);
        assert_eq!(bulk.entity_key(), None);

        assert_eq!(SyncEvent::new(EventKind::EntryUpdated, "t").entity_key(), None);

        let empty_id = SyncEvent::entry_deleted("", "t");
        assert_eq!(empty_id.entity_key(), None);
    }

    #[test]
    fn test_cursor_position() {
        let mut event = SyncEvent::new(EventKind::Welcome, "");
        assert_eq!(event.cursor_position(), None);

        event.last_seq = Some(4);
        assert_eq!(event.cursor_position(), Some(4));

        event.sequence_number = Some(9);
        assert_eq!(event.cursor_position(), Some(9));

        event.last_seq = Some(11);
        assert_eq!(event.cursor_position(), Some(11));
    }
}
