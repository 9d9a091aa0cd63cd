//! Command-line front-end: `brokerpilot [category] [broker_uri ...]`
//!
//! Connects a session over the given broker pool (defaults to three local
//! brokers), starts monitoring, and publishes a heartbeat until ctrl-c.

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::Result;
use rumqttc::QoS;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use brokerpilot::{ConnectOptions, DeviceCategory, PublishOutcome, SessionManager};

const DEFAULT_BROKERS: [&str; 3] = [
    "mqtt://localhost:1883",
    "mqtt://localhost:1884",
    "mqtt://localhost:1885",
];
const HEARTBEAT_TOPIC: &str = "brokerpilot/heartbeat";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let (category, brokers) = parse_args(std::env::args().skip(1).collect());
    info!("Device category: {} / brokers: {:?}", category, brokers);

    let opts = match std::env::var("BROKERPILOT_CONFIG") {
        Ok(path) => ConnectOptions::load_or_default(&PathBuf::from(path)),
        Err(_) => ConnectOptions::default(),
    };

    let session = SessionManager::with_options(category, opts);
    session.set_brokers(&brokers);

    session.set_on_connected(|uri| info!("Session bound to {}", uri));
    session.set_on_connection_lost(|cause| warn!("Connection lost: {}", cause));
    session.set_on_message_arrived(|publish| {
        info!(
            "Message on {}: {} bytes",
            publish.topic,
            publish.payload.len()
        );
    });

    if !session.connect().await {
        warn!("No broker reachable yet, publishes will be queued");
    }
    session.start_monitoring();

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut stats = tokio::time::interval(STATS_INTERVAL);
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            _ = heartbeat.tick() => {
                sequence += 1;
                let payload = format!("{} {}", sequence, chrono::Utc::now().to_rfc3339());
                let outcome = session
                    .publish(HEARTBEAT_TOPIC, payload.into_bytes(), QoS::AtLeastOnce, false)
                    .await;
                if outcome == PublishOutcome::Queued {
                    info!("Heartbeat {} queued ({} pending)", sequence, session.get_queued_message_count());
                }
            }
            _ = stats.tick() => {
                for broker in session.get_broker_stats() {
                    info!(
                        "{} score={:.3} available={} latency={}ms bandwidth={}bps connections={}",
                        broker.uri,
                        broker.score,
                        broker.available,
                        broker.metrics.latency_ms,
                        broker.metrics.bandwidth_bps,
                        broker.metrics.connection_count,
                    );
                }
            }
        }
    }

    session.stop_monitoring().await?;
    session.disconnect().await;
    Ok(())
}

/// First argument is the device category unless it looks like a broker
/// address; everything else is a broker URI.
fn parse_args(args: Vec<String>) -> (DeviceCategory, Vec<String>) {
    let mut category = DeviceCategory::Sensor;
    let mut brokers = Vec::new();

    for (idx, arg) in args.iter().enumerate() {
        if idx == 0 && !looks_like_uri(arg) {
            category = arg.parse().unwrap_or(DeviceCategory::Sensor);
        } else {
            brokers.push(arg.clone());
        }
    }

    if brokers.is_empty() {
        brokers = DEFAULT_BROKERS.iter().map(|s| s.to_string()).collect();
    }
    (category, brokers)
}

fn looks_like_uri(arg: &str) -> bool {
    arg.contains("://") || arg.contains(':')
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_default_to_sensor_and_local_brokers() {
        let (category, brokers) = parse_args(vec![]);
        assert_eq!(category, DeviceCategory::Sensor);
        assert_eq!(brokers, DEFAULT_BROKERS.to_vec());
    }

    #[test]
    fn leading_category_is_recognized() {
        let (category, brokers) =
            parse_args(vec!["camera".to_string(), "mqtt://b:1883".to_string()]);
        assert_eq!(category, DeviceCategory::Camera);
        assert_eq!(brokers, vec!["mqtt://b:1883"]);
    }

    #[test]
    fn leading_uri_keeps_default_category() {
        let (category, brokers) = parse_args(vec!["mqtt://a:1883".to_string()]);
        assert_eq!(category, DeviceCategory::Sensor);
        assert_eq!(brokers, vec!["mqtt://a:1883"]);
    }
}
