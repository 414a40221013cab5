//! Last-writer-wins conflict resolution.
//!
//! Only the single `updatedAt` stamp is compared. There is no field-level
//! merge: when two devices edit different fields of one record while offline,
//! the older edit is lost.

use crate::clock::compare_timestamps;
use crate::protocol::Record;
use std::cmp::Ordering;

/// Outcome of comparing an inbound record with the local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    ApplyRemote,
    KeepLocal,
}

/// Decide whether an inbound version replaces the local one.
///
/// The inbound record wins only when its `updatedAt` is strictly newer.
/// Ties keep the local copy. An inbound record without a stamp never
/// overrides a local one; a local record without a stamp always yields.
pub fn resolve(local: Option<&Record>, incoming: &Record) -> Resolution {
    let Some(local) = local else {
        return Resolution::ApplyRemote;
    };
    match (incoming.updated_at.as_deref(), local.updated_at.as_deref()) {
        (Some(remote), Some(local)) if compare_timestamps(remote, local) == Ordering::Greater => {
            Resolution::ApplyRemote
        }
        (Some(_), None) => Resolution::ApplyRemote,
        _ => Resolution::KeepLocal,
    }
}
