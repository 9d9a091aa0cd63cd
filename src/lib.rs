//! # brokerpilot
//!
//! Self-adaptive MQTT publisher layer. The crate fronts a pool of candidate
//! brokers and transparently steers an application's publish/subscribe
//! traffic to whichever broker currently scores best on measured latency,
//! throughput, and load. When no broker is reachable, publishes are captured
//! in a bounded queue and replayed after reconnection.
//!
//! ## Architecture
//!
//! ```text
//! application ── SessionManager ── active MQTT client ── broker
//!                      ▲
//!                      │ switch suggestions
//!                 BrokerRegistry ◄── Monitor (ephemeral probe clients)
//! ```
//!
//! [`SessionManager`] is the only object an application needs: it owns the
//! single active client, falls through the candidate list on connect
//! failures, hot-swaps the session when the monitor finds a sufficiently
//! better broker, and drains the offline queue on every (re)connect.
//!
//! ## Example
//!
//! ```no_run
//! use brokerpilot::{DeviceCategory, SessionManager};
//! use rumqttc::QoS;
//!
//! # async fn run() {
//! let session = SessionManager::new(DeviceCategory::Sensor);
//! session.set_brokers(["mqtt://localhost:1883", "mqtt://localhost:1884"]);
//!
//! if session.connect().await {
//!     session.start_monitoring();
//!     session
//!         .publish("sensors/temp", b"21.5".to_vec(), QoS::AtLeastOnce, false)
//!         .await;
//! }
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod monitor;
pub mod session;

pub use broker::{score, BrokerMetrics, BrokerRecord, BrokerRegistry, DeviceCategory, WeightProfile};
pub use config::{parse_broker_uri, BrokerAddress, ConnectOptions};
pub use error::PilotError;
pub use monitor::MonitorEvent;
pub use session::{ConnectionState, OfflineQueue, PublishOutcome, QueuedPublish, SessionManager};
