//! # Broker Monitoring
//!
//! Background measurement of every registered broker. On a staggered
//! schedule the monitor connects short-lived MQTT clients to each candidate,
//! measures loopback latency, sustained publish throughput, and the
//! broker-reported connection count, and writes the results into the shared
//! registry.
//!
//! ## Module Architecture
//!
//! ```text
//! monitor/
//! ├── engine.rs - statum-driven worker loop, cadence gating, event emission
//! └── probe.rs  - one ephemeral MQTT client per measurement
//! ```
//!
//! ## Event Flow
//!
//! The worker never touches the active session directly. After each metric
//! update it emits a [`MonitorEvent`] on the channel handed to it at start;
//! the session manager's supervisor consumes those events and decides
//! whether to migrate. A failed latency or bandwidth probe marks the broker
//! unavailable; a failed `$SYS` read is logged and recorded as zero
//! connections, since not every broker exposes those topics.

pub mod engine;
pub mod probe;

pub use engine::{MonitorEvent, MonitorHandle};
