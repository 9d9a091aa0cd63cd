//! Connect options and broker address handling
//!
//! Centralizes the session-level MQTT connection settings (client identity,
//! keep-alive, credentials, persistence directory) and the parsing of broker
//! URIs into host/port pairs. Options are serializable so a deployment can
//! keep them in a TOML file next to the process instead of recompiling.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PilotError;

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Connection settings forwarded to the underlying MQTT client on every
/// (re)connect.
///
/// The session manager treats this as opaque configuration: it is captured
/// once via `set_connect_options` and applied verbatim each time a client is
/// built, including the clients created during broker swaps.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ConnectOptions {
    /// Client identifier announced to the broker.
    ///
    /// Ephemeral probe clients derive their own ids; this one names the
    /// long-lived session.
    pub client_id: String,

    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,

    /// Whether to request a clean session on connect.
    pub clean_session: bool,

    /// Optional username/password pair. Both must be set for credentials
    /// to be applied.
    pub username: Option<String>,
    pub password: Option<String>,

    /// Directory handed to the MQTT client for message persistence.
    ///
    /// Treated as an opaque path; it is created if missing before the first
    /// connect so the client library never sees a dangling location.
    pub persistence_dir: PathBuf,

    /// Capacity of the client's internal request channel.
    pub channel_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: "brokerpilot".to_string(),
            keep_alive_secs: 5,
            clean_session: true,
            username: None,
            password: None,
            persistence_dir: default_persistence_dir(),
            channel_capacity: 64,
        }
    }
}

impl ConnectOptions {
    /// Loads options from a TOML file, falling back to defaults when the
    /// file is absent or unparsable.
    ///
    /// Falling back instead of failing keeps the session usable with a
    /// broken config file; the problem is logged for the operator.
    pub fn load_or_default(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(opts) => opts,
                Err(e) => {
                    warn!("Failed to parse connect options from {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Ensures the persistence directory exists.
    pub fn ensure_persistence_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.persistence_dir)
    }
}

fn default_persistence_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("brokerpilot")
}

/// Host/port pair extracted from a broker URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

/// Parses a broker URI of the form `mqtt://host:port`, `tcp://host:port`,
/// or bare `host[:port]`. The port defaults to 1883.
pub fn parse_broker_uri(uri: &str) -> Result<BrokerAddress, PilotError> {
    let trimmed = uri
        .strip_prefix("mqtt://")
        .or_else(|| uri.strip_prefix("tcp://"))
        .unwrap_or(uri);

    if trimmed.is_empty() {
        return Err(PilotError::InvalidUri {
            uri: uri.to_string(),
            reason: "empty host".to_string(),
        });
    }

    let comps: Vec<&str> = trimmed.split(':').collect();
    let host = comps[0];
    if host.is_empty() {
        return Err(PilotError::InvalidUri {
            uri: uri.to_string(),
            reason: "empty host".to_string(),
        });
    }

    let port = match comps.get(1) {
        Some(raw) => raw.parse().map_err(|_| PilotError::InvalidUri {
            uri: uri.to_string(),
            reason: format!("invalid port {:?}", raw),
        })?,
        None => DEFAULT_MQTT_PORT,
    };

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_host_port() {
        let addr = parse_broker_uri("mqtt://broker.local:1884").unwrap();
        assert_eq!(addr.host, "broker.local");
        assert_eq!(addr.port, 1884);
    }

    #[test]
    fn parses_tcp_scheme_and_bare_forms() {
        assert_eq!(
            parse_broker_uri("tcp://10.0.0.2:1885").unwrap(),
            BrokerAddress {
                host: "10.0.0.2".to_string(),
                port: 1885
            }
        );
        assert_eq!(parse_broker_uri("localhost").unwrap().port, 1883);
        assert_eq!(parse_broker_uri("localhost:2000").unwrap().port, 2000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_broker_uri("mqtt://").is_err());
        assert!(parse_broker_uri("mqtt://host:notaport").is_err());
    }

    #[test]
    fn default_options_are_clean_session() {
        let opts = ConnectOptions::default();
        assert!(opts.clean_session);
        assert_eq!(opts.keep_alive_secs, 5);
        assert!(opts.username.is_none());
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let opts = ConnectOptions::load_or_default(Path::new("/nonexistent/brokerpilot.toml"));
        assert_eq!(opts, ConnectOptions::default());
    }
}
