//! Error types for the broker-steering layer
//!
//! Defines specific error categories for session management, broker probing,
//! and inter-task communication failures.

use std::time::Duration;
use thiserror::Error;

/// Error types for session and monitor operations
///
/// Each variant represents a specific failure mode in the steering pipeline.
/// Transient failures (connect refusals, probe timeouts) are handled
/// internally by fall-through and availability marking; the variants here
/// surface on the public API where the caller has to react.
#[derive(Debug, Error)]
pub enum PilotError {
    /// No active broker session
    ///
    /// Returned by `subscribe`/`unsubscribe` when the session manager holds
    /// no connected client. Publishes never produce this error; they are
    /// captured by the offline queue instead.
    #[error("not connected to any broker")]
    NotConnected,

    /// Establishing a session against a broker failed
    ///
    /// Covers TCP failures, CONNACK refusals, and the 10 s connect deadline
    /// expiring before the broker acknowledged the session.
    #[error("connect to {uri} failed: {reason}")]
    ConnectFailed { uri: String, reason: String },

    /// The underlying MQTT client rejected a request
    ///
    /// Raised when the client's request channel is closed or full, typically
    /// because the event loop went away mid-operation.
    #[error("mqtt client error: {0}")]
    Client(String),

    /// A broker measurement did not complete within its deadline
    #[error("probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    /// A broker measurement produced an unusable result
    ///
    /// Covers malformed `$SYS` payloads and loopback publishes that never
    /// arrived back on the probe subscription.
    #[error("probe failed: {0}")]
    Probe(String),

    /// A broker URI could not be parsed into host and port
    #[error("invalid broker uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// Inter-task channel communication failed
    ///
    /// Occurs when sending through the session event channel fails, usually
    /// because the supervisor task has already shut down.
    #[error("channel error: {0}")]
    Channel(String),

    /// Background task management failed
    ///
    /// Returned when a worker task panics or a join handle errors during
    /// shutdown.
    #[error("task error: {0}")]
    Task(String),
}

impl From<rumqttc::ClientError> for PilotError {
    fn from(err: rumqttc::ClientError) -> Self {
        PilotError::Client(err.to_string())
    }
}
