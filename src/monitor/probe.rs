//! Ephemeral broker measurements
//!
//! Each measurement builds its own short-lived MQTT client, drives the event
//! loop to completion of the probe, and disconnects. Probes never reuse the
//! session's client; a broker that is not the current one must be measurable
//! without disturbing live traffic.
//!
//! The latency probe subscribes before publishing and waits for the
//! subscription acknowledgement, so the loopback publish cannot outrun the
//! subscription on the broker side.

use std::time::{Duration, Instant};

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
};
use tokio::time::timeout;
use tracing::debug;

use crate::config::{parse_broker_uri, ConnectOptions};
use crate::error::PilotError;

/// Topic used for the self-loop latency probe.
pub const LATENCY_TOPIC: &str = "test/latency";
/// Topic used for the throughput probe.
pub const BANDWIDTH_TOPIC: &str = "test/bandwidth";
/// Broker-side statistics filter for the active connection count.
pub const SYS_CONNECTIONS_FILTER: &str = "$SYS/brokers/+/stats/connections/count";

const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const LATENCY_DEADLINE: Duration = Duration::from_secs(5);
const BANDWIDTH_DEADLINE: Duration = Duration::from_secs(10);
const SYS_DEADLINE: Duration = Duration::from_secs(5);
const SETTLE_TIMEOUT: Duration = Duration::from_millis(250);

const BANDWIDTH_MESSAGE_COUNT: usize = 10;
const BANDWIDTH_MESSAGE_SIZE: usize = 1024;

/// Measures the round-trip of a self-loop publish on `test/latency`,
/// in milliseconds.
pub async fn measure_latency(uri: &str, opts: &ConnectOptions) -> Result<u64, PilotError> {
    let (client, mut eventloop) = ephemeral_client(uri, "lat", opts)?;
    await_connack(&mut eventloop, PROBE_CONNECT_TIMEOUT).await?;

    client.subscribe(LATENCY_TOPIC, QoS::AtLeastOnce).await?;
    await_suback(&mut eventloop, LATENCY_DEADLINE).await?;

    let payload = chrono::Utc::now().timestamp_millis().to_string().into_bytes();
    let sent = Instant::now();
    client
        .publish(LATENCY_TOPIC, QoS::AtLeastOnce, false, payload.clone())
        .await?;

    let latency = loop {
        let remaining = remaining(LATENCY_DEADLINE, sent)?;
        match timeout(remaining, eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::Publish(publish))))
                if publish.topic == LATENCY_TOPIC && publish.payload == payload =>
            {
                break sent.elapsed().as_millis() as u64;
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => return Err(PilotError::Probe(e.to_string())),
            Err(_) => return Err(PilotError::ProbeTimeout(LATENCY_DEADLINE)),
        }
    };

    settle(client, eventloop).await;
    debug!("Latency probe for {}: {}ms", uri, latency);
    Ok(latency)
}

/// Measures sustained publish throughput in bytes/second: 10 messages of
/// 1024 bytes at QoS 1, timed from the first send to the last delivery
/// acknowledgement.
pub async fn measure_bandwidth(uri: &str, opts: &ConnectOptions) -> Result<u64, PilotError> {
    let (client, mut eventloop) = ephemeral_client(uri, "bw", opts)?;
    await_connack(&mut eventloop, PROBE_CONNECT_TIMEOUT).await?;

    let payload = vec![0u8; BANDWIDTH_MESSAGE_SIZE];
    let started = Instant::now();
    for _ in 0..BANDWIDTH_MESSAGE_COUNT {
        client
            .publish(BANDWIDTH_TOPIC, QoS::AtLeastOnce, false, payload.clone())
            .await?;
    }

    let mut acked = 0usize;
    while acked < BANDWIDTH_MESSAGE_COUNT {
        let remaining = remaining(BANDWIDTH_DEADLINE, started)?;
        match timeout(remaining, eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::PubAck(_)))) => acked += 1,
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => return Err(PilotError::Probe(e.to_string())),
            Err(_) => return Err(PilotError::ProbeTimeout(BANDWIDTH_DEADLINE)),
        }
    }
    let elapsed = started.elapsed();

    settle(client, eventloop).await;
    let bps = bytes_per_second(BANDWIDTH_MESSAGE_COUNT * BANDWIDTH_MESSAGE_SIZE, elapsed);
    debug!("Bandwidth probe for {}: {}bps", uri, bps);
    Ok(bps)
}

/// Reads the broker-reported connection count from the `$SYS` statistics
/// topics. Best-effort: brokers without `$SYS` support make this time out.
pub async fn measure_connection_count(uri: &str, opts: &ConnectOptions) -> Result<u64, PilotError> {
    let (client, mut eventloop) = ephemeral_client(uri, "sys", opts)?;
    await_connack(&mut eventloop, PROBE_CONNECT_TIMEOUT).await?;

    client.subscribe(SYS_CONNECTIONS_FILTER, QoS::AtMostOnce).await?;
    await_suback(&mut eventloop, SYS_DEADLINE).await?;

    let started = Instant::now();
    let count = loop {
        let remaining = remaining(SYS_DEADLINE, started)?;
        match timeout(remaining, eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                break parse_connection_count(&publish.payload)?;
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => return Err(PilotError::Probe(e.to_string())),
            Err(_) => return Err(PilotError::ProbeTimeout(SYS_DEADLINE)),
        }
    };

    settle(client, eventloop).await;
    debug!("Connection-count probe for {}: {}", uri, count);
    Ok(count)
}

/// Builds a clean-session client with a unique probe id.
///
/// The wall-clock suffix keeps concurrent probes against the same broker
/// from evicting each other's sessions.
fn ephemeral_client(
    uri: &str,
    kind: &str,
    opts: &ConnectOptions,
) -> Result<(AsyncClient, EventLoop), PilotError> {
    let addr = parse_broker_uri(uri)?;
    let client_id = format!(
        "{}-probe-{}-{}",
        opts.client_id,
        kind,
        chrono::Utc::now().timestamp_millis()
    );

    let mut mqtt_options = MqttOptions::new(client_id, addr.host, addr.port);
    mqtt_options
        .set_keep_alive(Duration::from_secs(5))
        .set_clean_session(true);
    if let (Some(user), Some(pw)) = (&opts.username, &opts.password) {
        mqtt_options.set_credentials(user, pw);
    }

    Ok(AsyncClient::new(mqtt_options, 16))
}

async fn await_connack(eventloop: &mut EventLoop, deadline: Duration) -> Result<(), PilotError> {
    let started = Instant::now();
    loop {
        let remaining = remaining(deadline, started)?;
        match timeout(remaining, eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(PilotError::Probe(format!(
                    "broker refused probe connection: {:?}",
                    ack.code
                )));
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => return Err(PilotError::Probe(e.to_string())),
            Err(_) => return Err(PilotError::ProbeTimeout(deadline)),
        }
    }
}

async fn await_suback(eventloop: &mut EventLoop, deadline: Duration) -> Result<(), PilotError> {
    let started = Instant::now();
    loop {
        let remaining = remaining(deadline, started)?;
        match timeout(remaining, eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::SubAck(_)))) => return Ok(()),
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => return Err(PilotError::Probe(e.to_string())),
            Err(_) => return Err(PilotError::ProbeTimeout(deadline)),
        }
    }
}

/// Requests a disconnect and drains the event loop briefly so the
/// DISCONNECT packet actually leaves before the client is dropped.
async fn settle(client: AsyncClient, mut eventloop: EventLoop) {
    let _ = client.disconnect().await;
    let _ = timeout(SETTLE_TIMEOUT, async {
        loop {
            if eventloop.poll().await.is_err() {
                break;
            }
        }
    })
    .await;
}

fn remaining(deadline: Duration, since: Instant) -> Result<Duration, PilotError> {
    deadline
        .checked_sub(since.elapsed())
        .filter(|d| !d.is_zero())
        .ok_or(PilotError::ProbeTimeout(deadline))
}

fn parse_connection_count(payload: &[u8]) -> Result<u64, PilotError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| PilotError::Probe("non-utf8 $SYS payload".to_string()))?;
    text.trim()
        .parse()
        .map_err(|_| PilotError::Probe(format!("unparsable $SYS payload {:?}", text.trim())))
}

fn bytes_per_second(bytes: usize, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (bytes as f64 / secs) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sys_payload() {
        assert_eq!(parse_connection_count(b"42").unwrap(), 42);
        assert_eq!(parse_connection_count(b"  17\n").unwrap(), 17);
        assert!(parse_connection_count(b"many").is_err());
        assert!(parse_connection_count(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn computes_bytes_per_second() {
        assert_eq!(
            bytes_per_second(10 * 1024, Duration::from_millis(100)),
            102_400
        );
        assert_eq!(bytes_per_second(0, Duration::from_secs(1)), 0);
        assert_eq!(bytes_per_second(1024, Duration::ZERO), 0);
    }

    #[test]
    fn remaining_window_shrinks_and_expires() {
        let started = Instant::now();
        let left = remaining(Duration::from_secs(5), started).unwrap();
        assert!(left <= Duration::from_secs(5));

        if let Some(past) = Instant::now().checked_sub(Duration::from_secs(10)) {
            assert!(remaining(Duration::from_secs(5), past).is_err());
        }
    }
}
