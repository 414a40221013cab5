//! practice-sync library: native runtime for the realtime sync client.
//!
//! Wires the platform-independent core to tokio, a tokio-tungstenite
//! WebSocket transport, and a file-backed store. Exposed as a library so
//! integration tests can drive the client directly.

pub mod client;
pub mod file_store;
pub mod state;
pub mod websocket;

// Re-export key types for convenience
pub use client::{SendOutcome, SyncClient};
pub use file_store::FileStore;
pub use state::{ConnectionState, ConnectionStatus, StatusNotifier, Subscription};
pub use websocket::{MAX_MESSAGE_SIZE, WebSocketFactory, WebSocketTransport, install_crypto_provider};
