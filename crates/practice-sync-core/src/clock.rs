//! ISO-8601 timestamp helpers.
//!
//! Timestamps travel on the wire and in persisted state as RFC 3339 strings.
//! They are kept as strings in the data model so that a malformed value from a
//! misbehaving peer can still be carried, compared, and clamped instead of
//! failing the whole frame.

use chrono::{DateTime, SecondsFormat, Utc};
use std::cmp::Ordering;

/// Parse an RFC 3339 timestamp into UTC. Returns `None` for anything unparsable.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Format an instant the way the sync server emits timestamps.
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current wall-clock time as a wire timestamp.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Compare two wire timestamps.
///
/// Parsed instants are compared when both sides parse; otherwise falls back to
/// plain string comparison, which orders same-format ISO-8601 strings correctly.
pub fn compare_timestamps(a: &str, b: &str) -> Ordering {
    match (parse_timestamp(a), parse_timestamp(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}
