//! Session orchestration
//!
//! [`SessionManager`] is the single object an application holds. It owns the
//! active client slot, the connection state machine, and the offline queue,
//! and it consumes monitor events to migrate the session when another broker
//! sufficiently outscores the current one.
//!
//! All reconnection work runs in a supervisor task so that callback threads
//! and application calls never block on connection establishment. The
//! supervisor keeps only a `Weak` reference to the session state; dropping
//! the manager ends the supervisor and the client event driver without a
//! cycle between them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rumqttc::{Publish, QoS};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::client::{self, Callbacks};
use super::queue::{OfflineQueue, QueuedPublish};
use super::SessionEvent;
use crate::broker::{BrokerRecord, BrokerRegistry, DeviceCategory};
use crate::config::ConnectOptions;
use crate::error::PilotError;
use crate::monitor::{MonitorEvent, MonitorHandle};

/// Wait cap for an orderly disconnect of the active client.
const DISCONNECT_WAIT: Duration = Duration::from_secs(5);
/// Pause before rescanning the pool once every candidate has failed.
const ALL_EXHAUSTED_BACKOFF: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Where the session currently stands in its connection lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and no attempt in progress.
    Idle,
    /// Initial fall-through is at candidate index `i`.
    Connecting(usize),
    /// Bound to the named broker.
    Connected(String),
    /// Re-establishing after loss or swap; `uri` is the broker the session
    /// was previously bound to.
    Reconnecting { uri: String, cursor: usize },
}

/// What happened to a publish request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the active client.
    Sent,
    /// Captured by the offline queue for replay after (re)connect.
    Queued,
}

struct Connection {
    state: ConnectionState,
    active: Option<client::ActiveClient>,
}

struct SessionInner {
    registry: Arc<BrokerRegistry>,
    queue: OfflineQueue,
    /// Serializes state transitions and client-slot mutation.
    conn: tokio::sync::Mutex<Connection>,
    /// Mirrors `conn.state` being `Connected` for lock-free reads.
    connected: AtomicBool,
    /// Guard against overlapping connect/swap attempts.
    connecting: AtomicBool,
    /// Set by `disconnect()`; stops the background reconnect loop.
    manual_disconnect: AtomicBool,
    connect_opts: Mutex<ConnectOptions>,
    callbacks: Arc<Callbacks>,
    events_tx: mpsc::Sender<SessionEvent>,
    monitor: Mutex<Option<MonitorHandle>>,
}

/// Self-adaptive MQTT session over a pool of candidate brokers.
///
/// Construction requires a running Tokio runtime; the supervisor task is
/// spawned immediately, the first client only on `connect()`.
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Creates a manager whose broker scores are weighted for `category`.
    pub fn new(category: DeviceCategory) -> Self {
        Self::with_options(category, ConnectOptions::default())
    }

    pub fn with_options(category: DeviceCategory, opts: ConnectOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(SessionInner {
            registry: Arc::new(BrokerRegistry::new(category.weights())),
            queue: OfflineQueue::new(),
            conn: tokio::sync::Mutex::new(Connection {
                state: ConnectionState::Idle,
                active: None,
            }),
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            // Until the first connect() the supervisor must not auto-connect
            // on monitor suggestions.
            manual_disconnect: AtomicBool::new(true),
            connect_opts: Mutex::new(opts),
            callbacks: Arc::new(Callbacks::default()),
            events_tx,
            monitor: Mutex::new(None),
        });

        tokio::spawn(supervise(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    // ---- broker pool -----------------------------------------------------

    pub fn add_broker(&self, uri: &str) {
        self.inner.registry.add(uri);
    }

    pub fn remove_broker(&self, uri: &str) {
        self.inner.registry.remove(uri);
    }

    pub fn set_brokers<I, S>(&self, uris: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.registry.set_brokers(uris);
    }

    /// Operator override restoring a broker that probe failures (or failed
    /// connect attempts) removed from the candidate set.
    pub fn mark_broker_available(&self, uri: &str) {
        self.inner.registry.mark_available(uri);
    }

    /// Replaces the options applied to every future (re)connect.
    pub fn set_connect_options(&self, opts: ConnectOptions) {
        *lock(&self.inner.connect_opts) = opts;
    }

    // ---- connection lifecycle -------------------------------------------

    /// Attempts to establish a session, trying each available broker in
    /// registration order. Returns true on the first success, false once
    /// every candidate has failed. Idempotent: when already connected (or a
    /// background reconnect is running) it reports the current state
    /// without starting another attempt.
    pub async fn connect(&self) -> bool {
        let inner = &self.inner;
        inner.manual_disconnect.store(false, Ordering::SeqCst);

        if inner.connected.load(Ordering::SeqCst) {
            return true;
        }
        if inner.connecting.swap(true, Ordering::SeqCst) {
            return inner.connected.load(Ordering::SeqCst);
        }

        let connected_uri = {
            let mut conn = inner.conn.lock().await;
            if let Some(stale) = conn.active.take() {
                stale.teardown().await;
            }
            let candidates: Vec<String> = inner
                .registry
                .all()
                .into_iter()
                .filter(|b| b.available)
                .map(|b| b.uri)
                .collect();
            inner.run_fallthrough(&mut conn, &candidates, None).await
        };

        let success = connected_uri.is_some();
        if let Some(uri) = connected_uri {
            inner.callbacks.fire_connected(&uri);
            inner.flush_queue().await;
        }
        inner.connecting.store(false, Ordering::SeqCst);
        success
    }

    /// Tears down the active session. Safe to call when not connected; the
    /// background reconnect loop stops as well.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.manual_disconnect.store(true, Ordering::SeqCst);

        let mut conn = inner.conn.lock().await;
        if let Some(active) = conn.active.take() {
            inner.connected.store(false, Ordering::SeqCst);
            let uri = active.uri.clone();
            if timeout(DISCONNECT_WAIT, active.client.disconnect())
                .await
                .is_err()
            {
                warn!("Disconnect of {} did not complete in time", uri);
            }
            active.teardown().await;
            info!("Disconnected from {}", uri);
        }
        conn.state = ConnectionState::Idle;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Snapshot of the connection state machine.
    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.conn.lock().await.state.clone()
    }

    // ---- traffic ---------------------------------------------------------

    /// Publishes through the active client, or captures the message in the
    /// offline queue when disconnected or when the forward fails. Never
    /// errors: a queued publish is replayed after the next (re)connect.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retained: bool,
    ) -> PublishOutcome {
        self.publish_message(QueuedPublish::new(topic.into(), payload.into(), qos, retained))
            .await
    }

    /// Pre-built message variant of [`publish`](Self::publish).
    pub async fn publish_message(&self, message: QueuedPublish) -> PublishOutcome {
        let inner = &self.inner;
        if inner.connected.load(Ordering::SeqCst) {
            let client = {
                let conn = inner.conn.lock().await;
                conn.active.as_ref().map(|a| a.client.clone())
            };
            if let Some(client) = client {
                match client
                    .publish(
                        message.topic.clone(),
                        message.qos,
                        message.retained,
                        message.payload.clone(),
                    )
                    .await
                {
                    Ok(()) => return PublishOutcome::Sent,
                    Err(e) => {
                        warn!("Publish on active client failed, queueing: {}", e);
                    }
                }
            }
        }

        inner.queue.enqueue(message);
        PublishOutcome::Queued
    }

    /// Subscribes on the active client. Fails fast when disconnected;
    /// subscriptions are not replayed across broker swaps.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), PilotError> {
        let client = self.active_client().await.ok_or(PilotError::NotConnected)?;
        client.subscribe(topic, qos).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), PilotError> {
        let client = self.active_client().await.ok_or(PilotError::NotConnected)?;
        client.unsubscribe(topic).await?;
        Ok(())
    }

    // ---- observation -----------------------------------------------------

    pub fn get_broker_stats(&self) -> Vec<BrokerRecord> {
        self.inner.registry.all()
    }

    pub fn get_current_broker_uri(&self) -> Option<String> {
        self.inner.registry.current_uri()
    }

    pub fn get_queued_message_count(&self) -> usize {
        self.inner.queue.len()
    }

    // ---- monitoring ------------------------------------------------------

    /// Starts the background measurement worker. No-op when running.
    pub fn start_monitoring(&self) {
        let mut slot = lock(&self.inner.monitor);
        if slot.is_some() {
            return;
        }

        let (monitor_tx, mut monitor_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let events_tx = self.inner.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = monitor_rx.recv().await {
                if events_tx.send(SessionEvent::Monitor(event)).await.is_err() {
                    break;
                }
            }
        });

        let opts = lock(&self.inner.connect_opts).clone();
        *slot = Some(MonitorHandle::start(
            Arc::clone(&self.inner.registry),
            opts,
            monitor_tx,
        ));
    }

    /// Stops and joins the measurement worker.
    pub async fn stop_monitoring(&self) -> Result<(), PilotError> {
        let handle = lock(&self.inner.monitor).take();
        if let Some(mut handle) = handle {
            handle.stop().await?;
        }
        Ok(())
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.inner.monitor).is_some()
    }

    // ---- callbacks -------------------------------------------------------

    pub fn set_on_connected(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.callbacks.set_connected(Box::new(cb));
    }

    pub fn set_on_connection_lost(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.callbacks.set_connection_lost(Box::new(cb));
    }

    pub fn set_on_message_arrived(&self, cb: impl Fn(&Publish) + Send + Sync + 'static) {
        self.inner.callbacks.set_message_arrived(Box::new(cb));
    }

    pub fn set_on_delivery_complete(&self, cb: impl Fn(u16) + Send + Sync + 'static) {
        self.inner.callbacks.set_delivery_complete(Box::new(cb));
    }

    async fn active_client(&self) -> Option<rumqttc::AsyncClient> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return None;
        }
        let conn = self.inner.conn.lock().await;
        conn.active.as_ref().map(|a| a.client.clone())
    }
}

impl SessionInner {
    /// Tries each candidate in order under the connection lock. On success
    /// the client is installed, the registry's current marker moves, and
    /// the bound URI is returned; callbacks and queue replay are the
    /// caller's job once the lock is released.
    async fn run_fallthrough(
        &self,
        conn: &mut Connection,
        candidates: &[String],
        reconnect_from: Option<&str>,
    ) -> Option<String> {
        if candidates.is_empty() {
            warn!("No available brokers to connect to");
            conn.state = ConnectionState::Idle;
            return None;
        }

        let opts = lock(&self.connect_opts).clone();
        for (cursor, uri) in candidates.iter().enumerate() {
            conn.state = match reconnect_from {
                Some(prev) => ConnectionState::Reconnecting {
                    uri: prev.to_string(),
                    cursor,
                },
                None => ConnectionState::Connecting(cursor),
            };

            match client::try_connect(
                uri,
                &opts,
                Arc::clone(&self.callbacks),
                self.events_tx.clone(),
            )
            .await
            {
                Ok(active) => {
                    conn.active = Some(active);
                    conn.state = ConnectionState::Connected(uri.clone());
                    self.registry.set_current(uri);
                    self.connected.store(true, Ordering::SeqCst);
                    return Some(uri.clone());
                }
                Err(e) => {
                    warn!("Connect attempt to {} failed: {}", uri, e);
                    self.registry.mark_unavailable(uri);
                }
            }
        }

        conn.state = ConnectionState::Idle;
        None
    }

    /// Swap/reconnect driver: tears down whatever client is in the slot and
    /// re-runs the fall-through starting from the best-scored broker,
    /// backing off 5 s whenever the whole pool has been exhausted. Re-entry
    /// while an attempt is running is a no-op, as is running after an
    /// explicit disconnect.
    async fn switch_to_best_broker(&self) {
        if self.connecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already in progress, ignoring switch request");
            return;
        }

        loop {
            if self.manual_disconnect.load(Ordering::SeqCst) {
                break;
            }

            let connected_uri = {
                let mut conn = self.conn.lock().await;
                let previous = match conn.active.take() {
                    Some(old) => {
                        // In-flight publishes on the old client are
                        // abandoned at this point.
                        self.connected.store(false, Ordering::SeqCst);
                        let uri = old.uri.clone();
                        old.teardown().await;
                        Some(uri)
                    }
                    None => self.registry.current_uri(),
                };
                let candidates = self.swap_candidates();
                self.run_fallthrough(&mut conn, &candidates, previous.as_deref())
                    .await
            };

            if let Some(uri) = connected_uri {
                info!("Session migrated to {}", uri);
                self.callbacks.fire_connected(&uri);
                self.flush_queue().await;
                break;
            }

            debug!("All brokers exhausted, retrying in {:?}", ALL_EXHAUSTED_BACKOFF);
            tokio::time::sleep(ALL_EXHAUSTED_BACKOFF).await;
        }

        self.connecting.store(false, Ordering::SeqCst);
    }

    /// Available brokers rotated so the best-scored one is tried first and
    /// the rest follow in registration order. When every broker has been
    /// marked unavailable the full pool is retried from the top; a broker
    /// that recovered will accept, the others fail fast again.
    fn swap_candidates(&self) -> Vec<String> {
        let all = self.registry.all();
        let mut candidates: Vec<String> = all
            .iter()
            .filter(|b| b.available)
            .map(|b| b.uri.clone())
            .collect();
        if candidates.is_empty() {
            return all.into_iter().map(|b| b.uri).collect();
        }
        if let Some(best) = self.registry.best() {
            if let Some(pos) = candidates.iter().position(|u| *u == best.uri) {
                candidates.rotate_left(pos);
            }
        }
        candidates
    }

    /// Replays queued publishes in FIFO order, stopping at the first error
    /// and leaving the failed entry at the head for the next attempt.
    async fn flush_queue(&self) {
        let client = {
            let conn = self.conn.lock().await;
            match conn.active.as_ref() {
                Some(active) => active.client.clone(),
                None => return,
            }
        };

        let mut replayed = 0usize;
        while let Some(entry) = self.queue.pop_front() {
            match client
                .publish(
                    entry.topic.clone(),
                    entry.qos,
                    entry.retained,
                    entry.payload.clone(),
                )
                .await
            {
                Ok(()) => replayed += 1,
                Err(e) => {
                    warn!(
                        "Offline replay stopped with {} entries left: {}",
                        self.queue.len() + 1,
                        e
                    );
                    self.queue.restore_front(entry);
                    break;
                }
            }
        }

        if replayed > 0 {
            info!("Replayed {} queued publishes", replayed);
        }
    }
}

/// Supervisor loop: reacts to connection losses and monitor suggestions.
///
/// Holds the session state only weakly; once the manager is dropped the
/// next event (or channel closure) ends the task.
async fn supervise(inner: Weak<SessionInner>, mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            SessionEvent::ConnectionLost { uri, epoch, cause } => {
                let is_current = {
                    let conn = inner.conn.lock().await;
                    conn.active.as_ref().map(|a| a.epoch) == Some(epoch)
                };
                if !is_current {
                    debug!("Ignoring stale connection loss for {}", uri);
                    continue;
                }

                inner.connected.store(false, Ordering::SeqCst);
                inner.callbacks.fire_connection_lost(&cause);
                inner.switch_to_best_broker().await;
            }
            SessionEvent::Monitor(MonitorEvent::MetricsUpdated { uri, metrics }) => {
                debug!(
                    "Metrics for {}: latency={}ms bandwidth={}bps connections={}",
                    uri, metrics.latency_ms, metrics.bandwidth_bps, metrics.connection_count
                );
            }
            SessionEvent::Monitor(MonitorEvent::SwitchSuggested { uri }) => {
                // Re-check: the registry may have moved on since the
                // suggestion was queued.
                if inner.registry.should_switch() {
                    info!("Swapping session toward better broker {}", uri);
                    inner.switch_to_best_broker().await;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(DeviceCategory::Sensor)
    }

    #[tokio::test]
    async fn starts_idle_and_disconnected() {
        let session = manager();
        assert!(!session.is_connected());
        assert!(!session.is_monitoring());
        assert_eq!(session.connection_state().await, ConnectionState::Idle);
        assert_eq!(session.get_current_broker_uri(), None);
    }

    #[tokio::test]
    async fn broker_pool_passthrough() {
        let session = manager();
        session.add_broker("mqtt://a:1883");
        session.add_broker("mqtt://b:1883");
        session.remove_broker("mqtt://b:1883");
        assert_eq!(
            session.get_current_broker_uri().as_deref(),
            Some("mqtt://a:1883")
        );

        session.set_brokers(["mqtt://x:1883", "mqtt://y:1883", "mqtt://x:1883"]);
        let uris: Vec<String> = session.get_broker_stats().into_iter().map(|b| b.uri).collect();
        assert_eq!(uris, vec!["mqtt://x:1883", "mqtt://y:1883"]);
    }

    #[tokio::test]
    async fn publish_while_disconnected_queues() {
        let session = manager();
        let outcome = session
            .publish("sensors/temp", b"21.5".to_vec(), QoS::AtLeastOnce, false)
            .await;
        assert_eq!(outcome, PublishOutcome::Queued);
        assert_eq!(session.get_queued_message_count(), 1);

        session
            .publish_message(QueuedPublish::new(
                "sensors/temp",
                b"22.0".to_vec(),
                QoS::AtLeastOnce,
                false,
            ))
            .await;
        assert_eq!(session.get_queued_message_count(), 2);
    }

    #[tokio::test]
    async fn subscribe_fails_fast_while_disconnected() {
        let session = manager();
        let err = session.subscribe("sensors/#", QoS::AtLeastOnce).await;
        assert!(matches!(err, Err(PilotError::NotConnected)));
        let err = session.unsubscribe("sensors/#").await;
        assert!(matches!(err, Err(PilotError::NotConnected)));
    }

    #[tokio::test]
    async fn connect_with_empty_pool_returns_false() {
        let session = manager();
        assert!(!session.connect().await);
        assert_eq!(session.connection_state().await, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn connect_with_unparsable_uri_fails_and_marks_unavailable() {
        let session = manager();
        session.add_broker("mqtt://");
        assert!(!session.connect().await);

        let stats = session.get_broker_stats();
        assert_eq!(stats.len(), 1);
        assert!(!stats[0].available);
        assert_eq!(stats[0].score, 0.0);
    }

    #[tokio::test]
    async fn disconnect_without_session_is_safe() {
        let session = manager();
        session.disconnect().await;
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn monitoring_round_trip() {
        let session = manager();
        assert!(!session.is_monitoring());

        session.start_monitoring();
        assert!(session.is_monitoring());
        // Second start is a no-op.
        session.start_monitoring();

        session.stop_monitoring().await.unwrap();
        assert!(!session.is_monitoring());
        session.stop_monitoring().await.unwrap();
    }

    #[tokio::test]
    async fn operator_can_restore_an_unavailable_broker() {
        let session = manager();
        session.add_broker("mqtt://");
        let _ = session.connect().await;
        assert!(!session.get_broker_stats()[0].available);

        session.mark_broker_available("mqtt://");
        assert!(session.get_broker_stats()[0].available);
    }
}
