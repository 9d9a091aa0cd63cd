//! # Session Management
//!
//! The orchestrator the application talks to. A [`SessionManager`] owns at
//! most one live MQTT client at a time, binds it to the broker chosen from
//! the registry, and hides connection failures behind fall-through,
//! hot-swap migration, and the bounded offline queue.
//!
//! ## Module Architecture
//!
//! ```text
//! session/
//! ├── manager.rs - public API, connection state machine, supervisor task
//! ├── client.rs  - active client slot: connect handshake + event driver
//! └── queue.rs   - bounded FIFO of publishes captured while offline
//! ```
//!
//! ## Control Flow
//!
//! Application calls run against the manager directly. Connection-lost
//! notifications from the client's event driver and switch suggestions from
//! the monitor arrive on one internal channel, consumed by a supervisor
//! task that performs the actual reconnects and swaps. The supervisor holds
//! only a weak reference to the session state, so dropping the manager
//! tears everything down without a reference cycle.

pub mod client;
pub mod manager;
pub mod queue;

use crate::monitor::MonitorEvent;

pub use manager::{ConnectionState, PublishOutcome, SessionManager};
pub use queue::{OfflineQueue, QueuedPublish};

/// Internal notifications handled by the session supervisor.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// The active client's event loop errored out.
    ///
    /// `epoch` identifies which client generation observed the loss, so a
    /// notification that raced with a completed swap can be recognized as
    /// stale and dropped.
    ConnectionLost {
        uri: String,
        epoch: u64,
        cause: String,
    },
    /// Forwarded monitor notification.
    Monitor(MonitorEvent),
}
