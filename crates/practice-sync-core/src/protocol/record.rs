//! Opaque user records carried in event payloads.
//!
//! The sync core only looks at a record's identity (`id`, `scoreId` for
//! repertoire pieces) and its `updatedAt` stamp. Every other field passes
//! through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A practice entry or repertoire piece.
///
/// Wire format: `{"id":"e1","updatedAt":"2024-01-01T10:00:00Z", ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            updated_at: None,
            fields: Map::new(),
        }
    }

    pub fn with_updated_at(mut self, updated_at: impl Into<String>) -> Self {
        self.updated_at = Some(updated_at.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Score identifier of a repertoire piece, if the record carries one.
    pub fn score_id(&self) -> Option<&str> {
        self.fields.get("scoreId").and_then(Value::as_str)
    }

    /// Identity of a piece: its score when known, its own id otherwise.
    pub fn piece_key(&self) -> &str {
        self.score_id().unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_pass_through() {
        let json = r#"{"id":"e1","updatedAt":"2024-01-01T10:00:00Z","minutes":30,"notes":"scales"}"#;
        let record: Record = serde_json::from_str(json).unwrap();

        assert_eq!(record.id, "e1");
        assert_eq!(record.updated_at.as_deref(), Some("2024-01-01T10:00:00Z"));
        assert_eq!(record.field("minutes"), Some(&Value::from(30)));

        let back: Value = serde_json::to_value(&record).unwrap();
        assert_eq!(back["notes"], "scales");
        assert_eq!(back["updatedAt"], "2024-01-01T10:00:00Z");
    }

    #[test]
    fn test_missing_id_is_rejected() {
        assert!(serde_json::from_str::<Record>(r#"{"updatedAt":"x"}"#).is_err());
    }

    #[test]
    fn test_piece_key_prefers_score_id() {
        let piece = Record::new("p1").with_field("scoreId", "score-9");
        assert_eq!(piece.score_id(), Some("score-9"));
        assert_eq!(piece.piece_key(), "score-9");

        let bare = Record::new("p2");
        assert_eq!(bare.piece_key(), "p2");
    }
}
