//! WebSocket transport on tokio-tungstenite.
//!
//! The stream is split: the write half sits behind an async mutex for
//! `send`/`close`, and a read task forwards text frames as
//! [`TransportEvent`]s until the connection ends.

use async_trait::async_trait;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use practice_sync_core::transport::{
    NO_STATUS_RECEIVED, OpenedTransport, Result, Transport, TransportError, TransportEvent,
    TransportFactory,
};
use std::sync::{Arc, Once};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

/// Maximum inbound frame size (16MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Select ring as the process-wide rustls provider for `wss://` URLs.
/// Safe to call more than once; an already installed provider is kept.
pub fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider already installed");
        }
    });
}

/// Opens WebSocket connections, `ws://` or `wss://`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketFactory;

impl WebSocketFactory {
    pub fn new() -> Self {
        install_crypto_provider();
        Self
    }
}

#[async_trait]
impl TransportFactory for WebSocketFactory {
    async fn open(&self, url: &str) -> Result<OpenedTransport> {
        install_crypto_provider();
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!("WebSocket handshake complete");

        let (write, read) = ws_stream.split();
        let (event_tx, event_rx) = unbounded();
        let read_task = tokio::spawn(read_loop(read, event_tx));

        Ok(OpenedTransport {
            transport: Arc::new(WebSocketTransport {
                write: Mutex::new(write),
                read_task: std::sync::Mutex::new(Some(read_task)),
            }),
            events: event_rx,
        })
    }
}

/// Sending half of an open WebSocket.
pub struct WebSocketTransport {
    write: Mutex<SplitSink<WsStream, Message>>,
    read_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    fn stop_reader(&self) {
        if let Some(task) = self
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, frame: String) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(frame))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
                e => TransportError::SendFailed(e.to_string()),
            })
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let result = {
            let mut write = self.write.lock().await;
            write.send(Message::Close(Some(frame))).await
        };
        self.stop_reader();
        match result {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(e.to_string())),
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

/// Forward inbound frames until the connection ends, then report the close.
async fn read_loop(mut read: SplitStream<WsStream>, event_tx: UnboundedSender<TransportEvent>) {
    let closed = loop {
        let text = match read.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                debug!("Received close frame: {:?}", frame);
                break match frame {
                    Some(frame) => TransportEvent::Closed {
                        code: u16::from(frame.code),
                        reason: frame.reason.into_owned(),
                    },
                    None => TransportEvent::Closed {
                        code: NO_STATUS_RECEIVED,
                        reason: String::new(),
                    },
                };
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Connection closed");
                    }
                    _ => {
                        error!("WebSocket error: {}", e);
                        let _ = event_tx.unbounded_send(TransportEvent::Error(e.to_string()));
                    }
                }
                break TransportEvent::abnormal(e.to_string());
            }
            None => {
                debug!("Stream ended");
                break TransportEvent::abnormal("stream ended");
            }
        };

        if text.len() > MAX_MESSAGE_SIZE {
            warn!(
                "Message exceeds max size ({} > {}), dropping",
                text.len(),
                MAX_MESSAGE_SIZE
            );
            continue;
        }
        if event_tx.unbounded_send(TransportEvent::Message(text)).is_err() {
            // Receiver gone: nobody is listening to this connection any more
            return;
        }
    };

    let _ = event_tx.unbounded_send(closed);
}
