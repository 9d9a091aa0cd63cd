//! Monitor worker built on the Statum state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use statum::{machine, state, transition};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::probe;
use crate::broker::{BrokerMetrics, BrokerRegistry};
use crate::config::ConnectOptions;
use crate::error::PilotError;

/// One loop iteration per tick.
const MONITOR_TICK: Duration = Duration::from_secs(20);
/// Elapsed-time gates for the three measurement classes.
const LATENCY_CADENCE: Duration = Duration::from_secs(5);
const BANDWIDTH_CADENCE: Duration = Duration::from_secs(10);
const CONNECTION_CADENCE: Duration = Duration::from_secs(15);

/// Notifications the monitor emits toward the session manager.
#[derive(Clone, Debug)]
pub enum MonitorEvent {
    /// A broker's metrics were refreshed in the registry.
    MetricsUpdated { uri: String, metrics: BrokerMetrics },
    /// The registry now reports that `uri` sufficiently dominates the
    /// current broker.
    SwitchSuggested { uri: String },
}

/// Per-broker record of when each measurement class last ran.
#[derive(Clone, Copy, Debug, Default)]
struct ProbeClock {
    latency: Option<Instant>,
    bandwidth: Option<Instant>,
    connections: Option<Instant>,
}

fn due(last: Option<Instant>, cadence: Duration, now: Instant) -> bool {
    match last {
        Some(at) => now.duration_since(at) >= cadence,
        None => true,
    }
}

enum MetricSample {
    Latency(u64),
    Bandwidth(u64),
    Connections(u64),
}

/// Lifecycle states for the monitor worker.
#[state]
#[derive(Debug, Clone, Copy)]
pub enum MonitorState {
    Idle,
    Running,
}

/// Measurement worker for the broker pool.
///
/// Created idle, started exactly once, then driven inside its own task until
/// the shutdown signal fires. The engine only ever talks to the registry and
/// the event channel; session migration stays with the session manager.
#[machine]
pub struct MonitorEngine<MonitorState> {
    /// Shared broker pool this engine measures and updates.
    registry: Arc<BrokerRegistry>,

    /// Credentials and client-id base reused by the ephemeral probe clients.
    connect_opts: ConnectOptions,

    /// Channel toward the session manager's supervisor.
    events: mpsc::Sender<MonitorEvent>,

    /// Last-run bookkeeping per broker URI.
    clocks: HashMap<String, ProbeClock>,
}

impl MonitorEngine<Idle> {
    pub fn create(
        registry: Arc<BrokerRegistry>,
        connect_opts: ConnectOptions,
        events: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        Self::builder()
            .registry(registry)
            .connect_opts(connect_opts)
            .events(events)
            .clocks(HashMap::new())
            .build()
    }
}

#[transition]
impl MonitorEngine<Idle> {
    pub fn start(self) -> MonitorEngine<Running> {
        info!("Monitor starting ({} brokers)", self.registry.len());
        self.transition()
    }
}

#[transition]
impl MonitorEngine<Running> {
    /// Main measurement loop.
    ///
    /// The stop flag is checked between every broker and between the three
    /// measurement classes. A measurement already in flight completes or
    /// times out; ephemeral connections are never abandoned mid-probe.
    pub async fn run_until_shutdown(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> MonitorEngine<Idle> {
        loop {
            let uris = self.registry.uris();
            'brokers: for uri in uris {
                if *shutdown.borrow() {
                    break 'brokers;
                }
                self.probe_latency(&uri).await;

                if *shutdown.borrow() {
                    break 'brokers;
                }
                self.probe_bandwidth(&uri).await;

                if *shutdown.borrow() {
                    break 'brokers;
                }
                self.probe_connections(&uri).await;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(MONITOR_TICK) => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }

        info!("Monitor loop stopped");
        self.transition()
    }
}

impl MonitorEngine<Running> {
    async fn probe_latency(&mut self, uri: &str) {
        let now = Instant::now();
        let clock = self.clocks.entry(uri.to_string()).or_default();
        if !due(clock.latency, LATENCY_CADENCE, now) {
            return;
        }
        clock.latency = Some(now);

        match probe::measure_latency(uri, &self.connect_opts).await {
            Ok(ms) => self.apply_sample(uri, MetricSample::Latency(ms)).await,
            Err(e) => {
                warn!("Latency probe failed for {}: {}", uri, e);
                self.registry.mark_unavailable(uri);
            }
        }
    }

    async fn probe_bandwidth(&mut self, uri: &str) {
        let now = Instant::now();
        let clock = self.clocks.entry(uri.to_string()).or_default();
        if !due(clock.bandwidth, BANDWIDTH_CADENCE, now) {
            return;
        }
        clock.bandwidth = Some(now);

        match probe::measure_bandwidth(uri, &self.connect_opts).await {
            Ok(bps) => self.apply_sample(uri, MetricSample::Bandwidth(bps)).await,
            Err(e) => {
                warn!("Bandwidth probe failed for {}: {}", uri, e);
                self.registry.mark_unavailable(uri);
            }
        }
    }

    async fn probe_connections(&mut self, uri: &str) {
        let now = Instant::now();
        let clock = self.clocks.entry(uri.to_string()).or_default();
        if !due(clock.connections, CONNECTION_CADENCE, now) {
            return;
        }
        clock.connections = Some(now);

        match probe::measure_connection_count(uri, &self.connect_opts).await {
            Ok(count) => {
                self.apply_sample(uri, MetricSample::Connections(count))
                    .await
            }
            Err(e) => {
                // $SYS topics are optional; record zero, keep the broker.
                debug!("Connection-count probe failed for {}: {}", uri, e);
                self.apply_sample(uri, MetricSample::Connections(0)).await;
            }
        }
    }

    /// Merges one fresh sample with the broker's other recorded metrics and
    /// publishes the update, followed by a switch suggestion when the
    /// registry now favors another broker.
    async fn apply_sample(&self, uri: &str, sample: MetricSample) {
        // A successful probe restores availability before rescoring.
        if !matches!(sample, MetricSample::Connections(_)) {
            self.registry.mark_available(uri);
        }

        let mut metrics = self
            .registry
            .get(uri)
            .map(|b| b.metrics)
            .unwrap_or_default();
        match sample {
            MetricSample::Latency(ms) => metrics.latency_ms = ms,
            MetricSample::Bandwidth(bps) => metrics.bandwidth_bps = bps,
            MetricSample::Connections(count) => metrics.connection_count = count,
        }
        self.registry.update_metrics(uri, metrics);

        // try_send keeps the measurement loop independent of how fast the
        // session side drains events; a dropped notification is rebuilt by
        // the next probe anyway.
        self.emit(MonitorEvent::MetricsUpdated {
            uri: uri.to_string(),
            metrics,
        });

        if self.registry.should_switch() {
            if let Some(best) = self.registry.best() {
                info!(
                    "Monitor suggesting switch to {} (score {:.3})",
                    best.uri, best.score
                );
                self.emit(MonitorEvent::SwitchSuggested { uri: best.uri });
            }
        }
    }

    fn emit(&self, event: MonitorEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("Monitor event dropped: {}", e);
        }
    }
}

/// Handle for a running monitor worker.
///
/// Owns the task and its shutdown channel; `stop()` signals the flag and
/// joins the worker, so after it returns no probe task is left running.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    task_handle: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Spawns the measurement loop over `registry`.
    pub fn start(
        registry: Arc<BrokerRegistry>,
        connect_opts: ConnectOptions,
        events: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = MonitorEngine::create(registry, connect_opts, events).start();

        let task_handle = tokio::spawn(async move {
            let _idle = engine.run_until_shutdown(shutdown_rx).await;
        });

        Self {
            shutdown_tx,
            task_handle: Some(task_handle),
        }
    }

    /// True while the worker task has not been stopped.
    pub fn is_running(&self) -> bool {
        self.task_handle.is_some()
    }

    /// Signals shutdown and waits for the worker to finish its in-flight
    /// measurement and exit.
    pub async fn stop(&mut self) -> Result<(), PilotError> {
        if self.shutdown_tx.send(true).is_err() {
            debug!("Monitor task already terminated");
        }

        if let Some(handle) = self.task_handle.take() {
            handle
                .await
                .map_err(|e| PilotError::Task(format!("monitor task panicked: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::score::DeviceCategory;

    #[test]
    fn cadence_gate_opens_immediately_and_after_elapse() {
        let now = Instant::now();
        assert!(due(None, LATENCY_CADENCE, now));
        assert!(!due(Some(now), LATENCY_CADENCE, now));
        assert!(due(Some(now), LATENCY_CADENCE, now + LATENCY_CADENCE));
        assert!(!due(
            Some(now),
            BANDWIDTH_CADENCE,
            now + BANDWIDTH_CADENCE - Duration::from_millis(1)
        ));
    }

    #[test]
    fn probe_clock_starts_all_due() {
        let clock = ProbeClock::default();
        let now = Instant::now();
        assert!(due(clock.latency, LATENCY_CADENCE, now));
        assert!(due(clock.bandwidth, BANDWIDTH_CADENCE, now));
        assert!(due(clock.connections, CONNECTION_CADENCE, now));
    }

    #[tokio::test]
    async fn handle_stops_cleanly_with_empty_pool() {
        let registry = Arc::new(BrokerRegistry::new(DeviceCategory::Sensor.weights()));
        let (events_tx, _events_rx) = mpsc::channel(16);

        let mut handle = MonitorHandle::start(registry, ConnectOptions::default(), events_tx);
        assert!(handle.is_running());

        handle.stop().await.unwrap();
        assert!(!handle.is_running());

        // A second stop is a no-op.
        handle.stop().await.unwrap();
    }
}
