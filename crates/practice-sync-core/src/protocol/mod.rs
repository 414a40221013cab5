//! Wire protocol for the realtime sync connection.
//!
//! Every frame is a JSON text message decoded into a [`SyncEvent`]:
//! - [`EventKind`] tags the frame and classifies it (mutation, bulk, control)
//! - [`Record`] is the opaque entry/piece payload
//! - [`Topic`] names what a handler subscribes to, including the `"*"` wildcard

pub mod event;
pub mod kind;
pub mod record;

pub use event::{ProtocolError, SyncEvent};
pub use kind::{EventKind, Topic, UnknownKind};
pub use record::Record;
