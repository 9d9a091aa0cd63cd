//! Active client slot
//!
//! Builds the long-lived MQTT client for one broker, waits for the broker to
//! acknowledge the session, and runs the event-loop driver task that feeds
//! incoming traffic to the application callbacks. The driver never performs
//! work that can block under a lock; on a connection error it posts a
//! [`SessionEvent::ConnectionLost`] and exits, leaving recovery to the
//! session supervisor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, Publish};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::SessionEvent;
use crate::config::{parse_broker_uri, ConnectOptions};
use crate::error::PilotError;

/// Deadline for the broker to acknowledge a new session.
pub(crate) const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// Distinguishes client generations across swaps and reconnects.
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

pub type ConnectedCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type ConnectionLostCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(&Publish) + Send + Sync>;
pub type DeliveryCallback = Box<dyn Fn(u16) + Send + Sync>;

/// Application callback sinks, delivered from the event-driver task.
#[derive(Default)]
pub(crate) struct Callbacks {
    connected: Mutex<Option<ConnectedCallback>>,
    connection_lost: Mutex<Option<ConnectionLostCallback>>,
    message_arrived: Mutex<Option<MessageCallback>>,
    delivery_complete: Mutex<Option<DeliveryCallback>>,
}

impl Callbacks {
    pub fn set_connected(&self, cb: ConnectedCallback) {
        *lock(&self.connected) = Some(cb);
    }

    pub fn set_connection_lost(&self, cb: ConnectionLostCallback) {
        *lock(&self.connection_lost) = Some(cb);
    }

    pub fn set_message_arrived(&self, cb: MessageCallback) {
        *lock(&self.message_arrived) = Some(cb);
    }

    pub fn set_delivery_complete(&self, cb: DeliveryCallback) {
        *lock(&self.delivery_complete) = Some(cb);
    }

    pub fn fire_connected(&self, uri: &str) {
        if let Some(cb) = lock(&self.connected).as_ref() {
            cb(uri);
        }
    }

    pub fn fire_connection_lost(&self, cause: &str) {
        if let Some(cb) = lock(&self.connection_lost).as_ref() {
            cb(cause);
        }
    }

    pub fn fire_message_arrived(&self, publish: &Publish) {
        if let Some(cb) = lock(&self.message_arrived).as_ref() {
            cb(publish);
        }
    }

    pub fn fire_delivery_complete(&self, pkid: u16) {
        if let Some(cb) = lock(&self.delivery_complete).as_ref() {
            cb(pkid);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A connected client together with its event-driver task.
pub(crate) struct ActiveClient {
    pub uri: String,
    pub epoch: u64,
    pub client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

impl ActiveClient {
    /// Stops the driver task and waits for it to exit. Publishes still in
    /// flight on this client are abandoned.
    pub async fn teardown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.driver.await {
            warn!("Event driver for {} ended abnormally: {}", self.uri, e);
        }
    }
}

/// Builds a client for `uri` and waits up to 10 s for the broker to accept
/// the session. On success the event driver is already running and incoming
/// traffic flows to the callbacks.
pub(crate) async fn try_connect(
    uri: &str,
    opts: &ConnectOptions,
    callbacks: Arc<Callbacks>,
    events: mpsc::Sender<SessionEvent>,
) -> Result<ActiveClient, PilotError> {
    let addr = parse_broker_uri(uri)?;
    opts.ensure_persistence_dir()
        .map_err(|e| PilotError::ConnectFailed {
            uri: uri.to_string(),
            reason: format!("persistence dir unavailable: {}", e),
        })?;

    let mut mqtt_options = MqttOptions::new(&opts.client_id, addr.host, addr.port);
    mqtt_options
        .set_keep_alive(Duration::from_secs(opts.keep_alive_secs))
        .set_clean_session(opts.clean_session);
    if let (Some(user), Some(pw)) = (&opts.username, &opts.password) {
        mqtt_options.set_credentials(user, pw);
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, opts.channel_capacity);

    let started = Instant::now();
    loop {
        let remaining = CONNECT_DEADLINE
            .checked_sub(started.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| PilotError::ConnectFailed {
                uri: uri.to_string(),
                reason: format!("no CONNACK within {:?}", CONNECT_DEADLINE),
            })?;

        match timeout(remaining, eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                if ack.code == ConnectReturnCode::Success {
                    break;
                }
                return Err(PilotError::ConnectFailed {
                    uri: uri.to_string(),
                    reason: format!("broker refused session: {:?}", ack.code),
                });
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => {
                return Err(PilotError::ConnectFailed {
                    uri: uri.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(PilotError::ConnectFailed {
                    uri: uri.to_string(),
                    reason: format!("no CONNACK within {:?}", CONNECT_DEADLINE),
                })
            }
        }
    }

    let epoch = NEXT_EPOCH.fetch_add(1, Ordering::Relaxed);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver = tokio::spawn(drive(
        uri.to_string(),
        epoch,
        eventloop,
        shutdown_rx,
        callbacks,
        events,
    ));

    info!("Session established with broker {}", uri);
    Ok(ActiveClient {
        uri: uri.to_string(),
        epoch,
        client,
        shutdown_tx,
        driver,
    })
}

/// Event-loop driver for the active client.
///
/// Dispatches publishes and delivery acknowledgements to the application
/// callbacks and reports a connection loss exactly once before exiting.
async fn drive(
    uri: String,
    epoch: u64,
    mut eventloop: EventLoop,
    mut shutdown_rx: watch::Receiver<bool>,
    callbacks: Arc<Callbacks>,
    events: mpsc::Sender<SessionEvent>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("Event driver for {} shutting down", uri);
                break;
            }
            result = eventloop.poll() => match result {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    callbacks.fire_message_arrived(&publish);
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    callbacks.fire_delivery_complete(ack.pkid);
                }
                Ok(_) => {
                    // Pings, acks, outgoing confirmations.
                }
                Err(e) => {
                    warn!("Connection to {} lost: {}", uri, e);
                    let event = SessionEvent::ConnectionLost {
                        uri: uri.clone(),
                        epoch,
                        cause: e.to_string(),
                    };
                    // Bounded: a teardown signal must be able to interrupt
                    // the notification if the supervisor is saturated.
                    tokio::select! {
                        _ = events.send(event) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                    break;
                }
            }
        }
    }
}
