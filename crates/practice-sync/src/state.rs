//! Connection state and status notifications.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Lifecycle of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected and not trying to be
    #[default]
    Disconnected,
    /// First connection attempt in flight
    Connecting,
    /// Transport open
    Connected,
    /// Lost the connection, a reconnect is scheduled or in flight
    Reconnecting,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        })
    }
}

/// Snapshot returned by `SyncClient::connection_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

type Listener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_key: u64,
    listeners: BTreeMap<u64, Listener>,
    last: Option<ConnectionStatus>,
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps a status listener registered for as long as it is held.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    key: u64,
}

impl Subscription {
    /// Stop listening now instead of at drop.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.remove(&self.key);
        }
    }
}

/// Delivers connection status changes to registered listeners, in
/// registration order. Repeats of the last delivered status are skipped.
#[derive(Default)]
pub struct StatusNotifier {
    registry: SharedRegistry,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, listener: impl Fn(ConnectionStatus) + Send + Sync + 'static) -> Subscription {
        let mut registry = lock(&self.registry);
        let key = registry.next_key;
        registry.next_key += 1;
        registry.listeners.insert(key, Arc::new(listener));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            key,
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    /// Publish `status`. Returns false if it equals the previous one.
    pub fn notify(&self, status: ConnectionStatus) -> bool {
        let listeners: Vec<Listener> = {
            let mut registry = lock(&self.registry);
            if registry.last == Some(status) {
                return false;
            }
            registry.last = Some(status);
            registry.listeners.values().cloned().collect()
        };
        // Called unlocked so a listener may drop its own subscription
        for listener in listeners {
            listener(status);
        }
        true
    }
}
