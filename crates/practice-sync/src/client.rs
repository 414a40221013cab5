//! Realtime sync client.
//!
//! `SyncClient` owns the connection lifecycle:
//! - Connection establishment with a bounded timeout
//! - Heartbeat pings while connected
//! - Automatic reconnection with exponential backoff after abnormal closes
//! - Catch-up request and offline queue flush on every successful open
//!
//! Background tasks (reader, heartbeat, reconnect timer) hold a weak handle
//! and are tagged with a connection generation. Tasks belonging to an older
//! connection find the generation changed and do nothing.

use crate::state::{ConnectionState, ConnectionStatus, StatusNotifier, Subscription};
use chrono::Utc;
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use futures::future::{BoxFuture, FutureExt};
use practice_sync_core::protocol::{SyncEvent, Topic};
use practice_sync_core::queue::{OutboundQueue, QueuePolicy};
use practice_sync_core::router::{EventRouter, HandlerId};
use practice_sync_core::store::{self, KeyValueStore, StoreKeys};
use practice_sync_core::transport::{
    ABNORMAL_CLOSURE, NORMAL_CLOSURE, OpenedTransport, Transport, TransportEvent, TransportFactory,
};
use practice_sync_core::{SyncConfig, SyncStateTracker};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tracing::{debug, error, info, warn};

/// What `SyncClient::send` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Transmitted on the open connection
    Sent,
    /// Stored in the offline queue for the next flush
    Queued,
    /// Discarded: not a mutation, or no record to key it by
    Dropped,
}

#[derive(Clone)]
struct Credentials {
    user_id: String,
    credential: String,
}

/// Mutable connection state. Only touched in short, non-async sections.
#[derive(Default)]
struct Slot {
    state: ConnectionState,
    attempts: u32,
    generation: u64,
    credentials: Option<Credentials>,
    transport: Option<Arc<dyn Transport>>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Slot {
    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            reconnect_attempts: self.attempts,
        }
    }

    fn stop_tasks(&mut self) {
        for task in [
            self.reader.take(),
            self.heartbeat.take(),
            self.reconnect.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct Inner {
    config: SyncConfig,
    keys: StoreKeys,
    store: Arc<dyn KeyValueStore>,
    factory: Arc<dyn TransportFactory>,
    router: Arc<EventRouter>,
    queue: Mutex<OutboundQueue>,
    slot: Mutex<Slot>,
    status: StatusNotifier,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue(&self) -> MutexGuard<'_, OutboundQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.slot
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .stop_tasks();
    }
}

/// Client side of the realtime sync protocol.
///
/// Cheap to clone; clones share one connection. Dropping the last clone
/// aborts all background tasks.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<Inner>,
}

impl SyncClient {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn KeyValueStore>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let keys = StoreKeys::new(config.storage_prefix.clone());
        let tracker = SyncStateTracker::new(Arc::clone(&store), keys.clone());
        let policy = QueuePolicy {
            ttl: config.queue_ttl,
            capacity: config.queue_capacity,
        };
        let queue = OutboundQueue::new(Arc::clone(&store), keys.offline_queue(), policy);

        Self {
            inner: Arc::new(Inner {
                config,
                keys,
                store,
                factory,
                router: Arc::new(EventRouter::new(tracker)),
                queue: Mutex::new(queue),
                slot: Mutex::new(Slot::default()),
                status: StatusNotifier::new(),
            }),
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Router that inbound frames are dispatched through.
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.inner.router
    }

    pub fn tracker(&self) -> &SyncStateTracker {
        self.inner.router.tracker()
    }

    /// Register an inbound event handler. See [`EventRouter::on`].
    pub fn on(
        &self,
        topic: impl Into<Topic>,
        handler: impl Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.router.on(topic, handler)
    }

    /// Remove an inbound event handler.
    pub fn off(&self, topic: impl Into<Topic>, id: HandlerId) -> bool {
        self.inner.router.off(topic, id)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.slot().status()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status().is_connected()
    }

    /// Be notified of every state change. Drop the subscription to stop.
    pub fn subscribe_status(
        &self,
        listener: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.status.listen(listener)
    }

    pub fn realtime_enabled(&self) -> bool {
        store::realtime_enabled(self.inner.store.as_ref(), &self.inner.keys)
    }

    /// Persist the realtime flag. Disabling also disconnects.
    pub async fn set_realtime_enabled(&self, enabled: bool) {
        if let Err(e) =
            store::set_realtime_enabled(self.inner.store.as_ref(), &self.inner.keys, enabled)
        {
            warn!("Failed to persist realtime flag: {}", e);
        }
        if !enabled {
            self.disconnect().await;
        }
    }

    // ==================== Connection lifecycle ====================

    /// Open the realtime connection.
    ///
    /// Returns once the transport is open, failed, or timed out. A failed
    /// attempt is handled like an abnormal close and may schedule a reconnect.
    pub async fn connect(&self, user_id: &str, credential: &str) -> bool {
        if !self.realtime_enabled() {
            info!("Realtime sync is disabled, not connecting");
            return false;
        }

        let (previous, status, generation) = {
            let mut slot = self.inner.slot();
            slot.stop_tasks();
            slot.generation += 1;
            slot.attempts = 0;
            slot.credentials = Some(Credentials {
                user_id: user_id.to_string(),
                credential: credential.to_string(),
            });
            slot.state = ConnectionState::Connecting;
            (slot.transport.take(), slot.status(), slot.generation)
        };
        self.inner.status.notify(status);

        if let Some(previous) = previous {
            debug!("Closing previous connection");
            let _ = previous.close(NORMAL_CLOSURE, "reconnecting").await;
        }

        self.establish(generation).await
    }

    /// Close the connection without reconnecting. Safe to call in any state.
    pub async fn disconnect(&self) {
        let (transport, changed, status) = {
            let mut slot = self.inner.slot();
            slot.stop_tasks();
            slot.generation += 1;
            slot.attempts = 0;
            let changed = slot.state != ConnectionState::Disconnected;
            slot.state = ConnectionState::Disconnected;
            (slot.transport.take(), changed, slot.status())
        };
        if changed {
            info!("Disconnected");
            self.inner.status.notify(status);
        }

        if let Some(transport) = transport {
            if let Err(e) = transport.close(NORMAL_CLOSURE, "client disconnect").await {
                debug!("Close failed: {}", e);
            }
        }
    }

    /// Disconnect and forget the credentials. With `purge`, also drop the
    /// offline queue and both sync cursors.
    pub async fn logout(&self, purge: bool) {
        self.disconnect().await;
        self.inner.slot().credentials = None;
        if purge {
            self.inner.queue().clear();
            self.tracker().reset();
            info!("Purged offline queue and sync cursors");
        }
    }

    // Boxed so the reconnect task, which calls back into this, has a nameable type.
    fn establish(&self, expected: u64) -> BoxFuture<'static, bool> {
        let client = self.clone();
        async move { client.try_establish(expected).await }.boxed()
    }

    /// Open a transport on behalf of the caller that last set the generation
    /// to `expected`. Gives up without opening anything if a connect or
    /// disconnect has happened since.
    async fn try_establish(&self, expected: u64) -> bool {
        let (generation, credentials) = {
            let mut slot = self.inner.slot();
            if slot.generation != expected || slot.state == ConnectionState::Disconnected {
                debug!("Connection attempt superseded before opening");
                return false;
            }
            let Some(credentials) = slot.credentials.clone() else {
                return false;
            };
            slot.generation += 1;
            (slot.generation, credentials)
        };

        let url = match self
            .inner
            .config
            .connection_url(&credentials.user_id, &credentials.credential)
        {
            Ok(url) => url,
            Err(e) => {
                error!("{}", e);
                self.set_disconnected(generation);
                return false;
            }
        };

        debug!("Opening {}", self.inner.config.server_url());
        let opened = match timeout(
            self.inner.config.connect_timeout,
            self.inner.factory.open(url.as_str()),
        )
        .await
        {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                warn!("Connection attempt failed: {}", e);
                self.on_connection_lost(generation, ABNORMAL_CLOSURE);
                return false;
            }
            Err(_) => {
                warn!(
                    "Connection attempt timed out after {:?}",
                    self.inner.config.connect_timeout
                );
                self.on_connection_lost(generation, ABNORMAL_CLOSURE);
                return false;
            }
        };

        let OpenedTransport { transport, events } = opened;
        let status = {
            let mut slot = self.inner.slot();
            if slot.generation != generation {
                None
            } else {
                let weak = Arc::downgrade(&self.inner);
                slot.reader = Some(tokio::spawn(read_loop(weak.clone(), generation, events)));
                slot.heartbeat = Some(tokio::spawn(heartbeat_loop(
                    weak,
                    generation,
                    self.inner.config.heartbeat_interval,
                )));
                slot.transport = Some(Arc::clone(&transport));
                slot.attempts = 0;
                slot.state = ConnectionState::Connected;
                Some(slot.status())
            }
        };

        let Some(status) = status else {
            debug!("Connection superseded while opening, closing it");
            let _ = transport.close(NORMAL_CLOSURE, "superseded").await;
            return false;
        };

        info!("Connected to {}", self.inner.config.server_url());
        self.inner.status.notify(status);

        self.request_catch_up().await;
        self.flush().await;
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.slot().generation == generation
    }

    fn set_disconnected(&self, generation: u64) {
        let status = {
            let mut slot = self.inner.slot();
            if slot.generation != generation {
                return;
            }
            slot.state = ConnectionState::Disconnected;
            slot.status()
        };
        self.inner.status.notify(status);
    }

    /// The connection for `generation` ended with `code`. Schedules a
    /// reconnect when the close was abnormal and attempts remain.
    fn on_connection_lost(&self, generation: u64, code: u16) {
        let config = &self.inner.config;
        let status = {
            let mut slot = self.inner.slot();
            if slot.generation != generation {
                debug!("Ignoring close of superseded connection");
                return;
            }

            slot.transport = None;
            if let Some(heartbeat) = slot.heartbeat.take() {
                heartbeat.abort();
            }
            // The reader may be the caller; it exits on its own
            slot.reader = None;

            let retry = code != NORMAL_CLOSURE
                && config.auto_reconnect
                && slot.credentials.is_some()
                && slot.attempts < config.max_reconnect_attempts;

            if retry {
                let delay = config.reconnect_delay(slot.attempts);
                slot.attempts += 1;
                slot.state = ConnectionState::Reconnecting;
                info!(
                    "Scheduled reconnect in {:?} (attempt {}/{})",
                    delay, slot.attempts, config.max_reconnect_attempts
                );
                let weak = Arc::downgrade(&self.inner);
                slot.reconnect = Some(tokio::spawn(reconnect_after(weak, generation, delay)));
            } else {
                if code != NORMAL_CLOSURE && config.auto_reconnect {
                    warn!(
                        "Giving up after {} reconnect attempt(s)",
                        slot.attempts
                    );
                }
                slot.state = ConnectionState::Disconnected;
            }
            slot.status()
        };
        self.inner.status.notify(status);
    }

    // ==================== Outbound ====================

    /// Send an event, or queue it if it cannot be sent now.
    ///
    /// Only mutations with an identifiable record are queued; anything else
    /// is dropped when the connection is not open.
    pub async fn send(&self, event: SyncEvent) -> SendOutcome {
        let transport = {
            let slot = self.inner.slot();
            match slot.state {
                ConnectionState::Connected => slot.transport.clone(),
                _ => None,
            }
        };

        if let Some(transport) = transport {
            let frame = match event.to_json() {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to serialize {}: {}", event.kind, e);
                    return SendOutcome::Dropped;
                }
            };
            match transport.send(frame).await {
                Ok(()) => return SendOutcome::Sent,
                Err(e) => warn!("Failed to send {}: {}", event.kind, e),
            }
        }

        let kind = event.kind;
        if self.inner.queue().enqueue(event, Utc::now()) {
            debug!("Queued {} for later delivery", kind);
            SendOutcome::Queued
        } else {
            debug!("Dropped {} while offline", kind);
            SendOutcome::Dropped
        }
    }

    /// Send every queued event in enqueue order. Returns how many were sent.
    ///
    /// The queue is emptied before sending; events that fail to send go
    /// back through [`send`](Self::send) and are queued again.
    pub async fn flush(&self) -> usize {
        if !self.is_connected() {
            return 0;
        }
        let events = self.inner.queue().take_all();
        if events.is_empty() {
            return 0;
        }

        info!("Flushing {} queued event(s)", events.len());
        let mut sent = 0;
        for event in events {
            if self.send(event).await == SendOutcome::Sent {
                sent += 1;
            }
        }
        sent
    }

    async fn request_catch_up(&self) {
        let pending = {
            let mut queue = self.inner.queue();
            queue.reload();
            !queue.is_empty()
        };
        let request =
            self.tracker()
                .catch_up_request(pending, self.inner.config.catch_up_threshold, Utc::now());
        if let Some(request) = request {
            info!(
                "Requesting catch-up since {} (seq {})",
                request.last_sync_time.as_deref().unwrap_or("the beginning"),
                request.last_seq.unwrap_or(0)
            );
            self.send(request).await;
        }
    }

    /// Number of queued events, including those added by other contexts.
    pub fn offline_queue_size(&self) -> usize {
        let mut queue = self.inner.queue();
        queue.reload();
        queue.len()
    }

    pub fn clear_offline_queue(&self) {
        self.inner.queue().clear();
    }
}

async fn read_loop(weak: Weak<Inner>, generation: u64, mut events: UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.next().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let client = SyncClient::from_inner(inner);
        match event {
            TransportEvent::Message(frame) => {
                if !client.is_current(generation) {
                    return;
                }
                client.inner.router.handle_frame(&frame);
            }
            TransportEvent::Error(e) => warn!("Transport error: {}", e),
            TransportEvent::Closed { code, reason } => {
                info!("Connection closed (code {}): {}", code, reason);
                client.on_connection_lost(generation, code);
                return;
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        debug!("Transport event stream ended without a close");
        SyncClient::from_inner(inner).on_connection_lost(generation, ABNORMAL_CLOSURE);
    }
}

async fn heartbeat_loop(weak: Weak<Inner>, generation: u64, period: std::time::Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let client = SyncClient::from_inner(inner);
        if !client.is_current(generation) {
            return;
        }
        debug!("Sending heartbeat");
        client.send(SyncEvent::ping(Utc::now())).await;
    }
}

async fn reconnect_after(weak: Weak<Inner>, generation: u64, delay: std::time::Duration) {
    sleep(delay).await;
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let client = SyncClient::from_inner(inner);
    {
        let mut slot = client.inner.slot();
        if slot.generation != generation || slot.state != ConnectionState::Reconnecting {
            return;
        }
        // Detach: a later connect or disconnect must not abort an attempt in flight
        slot.reconnect.take();
    }
    // Rechecked under the lock that bumps the generation
    client.establish(generation).await;
}
