//! Transport trait abstraction for the realtime connection.
//!
//! A transport carries JSON text frames over a duplex connection. Opening one
//! yields a sender handle plus a stream of [`TransportEvent`]s; the stream
//! ends with exactly one `Closed`.
//!
//! Implementations:
//! - `WebSocketFactory` (in practice-sync) - tokio-tungstenite client
//! - Scripted fakes in tests

use async_trait::async_trait;
use futures::channel::mpsc::UnboundedReceiver;
use std::sync::Arc;
use thiserror::Error;

/// Close code for a deliberate shutdown. Never triggers reconnection.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close frame received without a status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Connection dropped without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Something observed on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound text frame.
    Message(String),
    /// The connection ended. Always the last event.
    Closed { code: u16, reason: String },
    /// A non-fatal error worth logging.
    Error(String),
}

impl TransportEvent {
    /// A close without a handshake.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        TransportEvent::Closed {
            code: ABNORMAL_CLOSURE,
            reason: reason.into(),
        }
    }
}

/// Sending half of an open connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame.
    async fn send(&self, frame: String) -> Result<()>;

    /// Close the connection with a status code.
    async fn close(&self, code: u16, reason: &str) -> Result<()>;
}

/// A freshly opened connection.
pub struct OpenedTransport {
    pub transport: Arc<dyn Transport>,
    pub events: UnboundedReceiver<TransportEvent>,
}

/// Opens connections to a URL.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, url: &str) -> Result<OpenedTransport>;
}
