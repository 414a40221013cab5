//! practice-sync-core: platform-independent realtime sync for practice journal data.
//!
//! This crate provides the core functionality for:
//! - The JSON wire protocol and event kinds
//! - A deduplicating, TTL-bounded outbound queue persisted across restarts
//! - Sync cursor tracking and the catch-up decision
//! - Inbound event routing and last-writer-wins conflict resolution
//! - KeyValueStore and Transport trait abstractions

pub mod clock;
pub mod config;
pub mod conflict;
pub mod cursor;
pub mod protocol;
pub mod queue;
pub mod replica;
pub mod router;
pub mod store;
pub mod transport;

pub use config::{ConfigError, Environment, SyncConfig};
pub use conflict::{Resolution, resolve};
pub use cursor::SyncStateTracker;
pub use protocol::{EventKind, ProtocolError, Record, SyncEvent, Topic};
pub use queue::{OutboundQueue, QueuePolicy, QueuedEvent};
pub use replica::{ApplyOutcome, Replica};
pub use router::{EventRouter, Handler, HandlerId};
pub use store::{BackupSlot, KeyValueStore, MemoryStore, StoreError, StoreKeys};
pub use transport::{OpenedTransport, Transport, TransportError, TransportEvent, TransportFactory};
