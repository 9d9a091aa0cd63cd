//! Thread-safe broker registry
//!
//! Keeps one record per configured broker URI together with its latest
//! metrics, score, and availability, plus the "current" marker for the
//! broker the active session is bound to. The registry is shared between
//! the session manager and the monitor; every operation takes the single
//! internal mutex and finishes without awaiting, so it is safe to call from
//! any task.

use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, warn};

use super::score::{score, WeightProfile};

/// Score advantage the best broker must hold over the current one before a
/// swap is suggested.
const SWITCH_THRESHOLD: f64 = 0.10;

/// Most recent active measurements for one broker. Zero means "never
/// measured" and excludes the metric from scoring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokerMetrics {
    /// Round-trip time of a self-loop publish, in milliseconds.
    pub latency_ms: u64,
    /// Sustained publish throughput, in bytes per second.
    pub bandwidth_bps: u64,
    /// Broker-reported count of active client connections.
    pub connection_count: u64,
}

/// One registered broker with its latest measurements and score.
#[derive(Clone, Debug)]
pub struct BrokerRecord {
    /// Transport address; identity key within the registry.
    pub uri: String,
    pub metrics: BrokerMetrics,
    /// Weighted score in [0, 1]; 0 while unavailable.
    pub score: f64,
    /// Cleared on probe failure, restored by a fresh successful probe.
    pub available: bool,
    /// Monotonic timestamp of the last metric update.
    pub last_check: Option<Instant>,
}

impl BrokerRecord {
    fn new(uri: String) -> Self {
        Self {
            uri,
            metrics: BrokerMetrics::default(),
            score: 0.0,
            available: true,
            last_check: None,
        }
    }
}

struct RegistryInner {
    brokers: Vec<BrokerRecord>,
    current: usize,
}

/// Registry of candidate brokers with selection predicates.
///
/// The weight profile is fixed at construction and re-applied on every
/// metric update. Records returned from accessors are snapshots; holding
/// one does not pin the registry state.
pub struct BrokerRegistry {
    inner: Mutex<RegistryInner>,
    weights: WeightProfile,
}

impl BrokerRegistry {
    pub fn new(weights: WeightProfile) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                brokers: Vec::new(),
                current: 0,
            }),
            weights,
        }
    }

    /// Registers a broker URI. No-op when the URI is already present.
    /// The first registered broker becomes current.
    pub fn add(&self, uri: &str) {
        let mut inner = self.lock();
        if inner.brokers.iter().any(|b| b.uri == uri) {
            return;
        }
        inner.brokers.push(BrokerRecord::new(uri.to_string()));
        if inner.brokers.len() == 1 {
            inner.current = 0;
        }
        debug!("Registered broker {} ({} total)", uri, inner.brokers.len());
    }

    /// Removes a broker, re-anchoring the current index so it stays in
    /// range: removing an earlier entry shifts the index left, removing the
    /// current or a later entry clamps it to the last record.
    pub fn remove(&self, uri: &str) {
        let mut inner = self.lock();
        let Some(idx) = inner.brokers.iter().position(|b| b.uri == uri) else {
            return;
        };
        inner.brokers.remove(idx);
        if inner.brokers.is_empty() {
            inner.current = 0;
        } else if idx < inner.current {
            inner.current -= 1;
        } else if inner.current >= inner.brokers.len() {
            inner.current = inner.brokers.len() - 1;
        }
    }

    /// Drops all records and resets the current marker.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.brokers.clear();
        inner.current = 0;
    }

    /// Replaces the pool with `uris`, dropping duplicates but keeping order.
    pub fn set_brokers<I, S>(&self, uris: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.clear();
        for uri in uris {
            self.add(uri.as_ref());
        }
    }

    /// Marks `uri` as current. Returns false when the URI is unknown.
    pub fn set_current(&self, uri: &str) -> bool {
        let mut inner = self.lock();
        match inner.brokers.iter().position(|b| b.uri == uri) {
            Some(idx) => {
                inner.current = idx;
                true
            }
            None => false,
        }
    }

    /// Snapshot of the current broker record, if any.
    pub fn current(&self) -> Option<BrokerRecord> {
        let inner = self.lock();
        inner.brokers.get(inner.current).cloned()
    }

    pub fn current_uri(&self) -> Option<String> {
        self.current().map(|b| b.uri)
    }

    /// Ordered snapshot of all records.
    pub fn all(&self) -> Vec<BrokerRecord> {
        self.lock().brokers.clone()
    }

    /// Ordered snapshot of all URIs.
    pub fn uris(&self) -> Vec<String> {
        self.lock().brokers.iter().map(|b| b.uri.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().brokers.is_empty()
    }

    /// Snapshot of a single record.
    pub fn get(&self, uri: &str) -> Option<BrokerRecord> {
        self.lock().brokers.iter().find(|b| b.uri == uri).cloned()
    }

    /// Replaces all three metrics for `uri`, stamps `last_check`, and
    /// recomputes the score with the registry's weight profile.
    pub fn update_metrics(&self, uri: &str, metrics: BrokerMetrics) {
        let weights = self.weights;
        let mut inner = self.lock();
        let Some(broker) = inner.brokers.iter_mut().find(|b| b.uri == uri) else {
            warn!("Metric update for unknown broker {}", uri);
            return;
        };
        broker.metrics = metrics;
        broker.last_check = Some(Instant::now());
        broker.score = if broker.available {
            score(&broker.metrics, &weights)
        } else {
            0.0
        };
        debug!(
            "Updated {}: latency={}ms bandwidth={}bps connections={} score={:.3}",
            uri, metrics.latency_ms, metrics.bandwidth_bps, metrics.connection_count, broker.score
        );
    }

    /// Clears availability and forces the score to 0.
    pub fn mark_unavailable(&self, uri: &str) {
        let mut inner = self.lock();
        if let Some(broker) = inner.brokers.iter_mut().find(|b| b.uri == uri) {
            if broker.available {
                warn!("Broker {} marked unavailable", uri);
            }
            broker.available = false;
            broker.score = 0.0;
        }
    }

    /// Restores availability and recomputes the score from the recorded
    /// metrics.
    pub fn mark_available(&self, uri: &str) {
        let weights = self.weights;
        let mut inner = self.lock();
        if let Some(broker) = inner.brokers.iter_mut().find(|b| b.uri == uri) {
            broker.available = true;
            broker.score = score(&broker.metrics, &weights);
        }
    }

    /// Highest-scoring available broker; ties break toward registration
    /// order. `None` when no broker is available.
    pub fn best(&self) -> Option<BrokerRecord> {
        let inner = self.lock();
        let mut best: Option<&BrokerRecord> = None;
        for broker in inner.brokers.iter().filter(|b| b.available) {
            match best {
                Some(current_best) if broker.score <= current_best.score => {}
                _ => best = Some(broker),
            }
        }
        best.cloned()
    }

    /// True iff the best available broker differs from the current one and
    /// leads it by more than the hysteresis threshold.
    pub fn should_switch(&self) -> bool {
        let (Some(best), Some(current)) = (self.best(), self.current()) else {
            return false;
        };
        best.uri != current.uri && best.score - current.score > SWITCH_THRESHOLD
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // Registry state stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::score::DeviceCategory;

    fn registry() -> BrokerRegistry {
        BrokerRegistry::new(DeviceCategory::Sensor.weights())
    }

    fn metrics(latency_ms: u64, bandwidth_bps: u64, connection_count: u64) -> BrokerMetrics {
        BrokerMetrics {
            latency_ms,
            bandwidth_bps,
            connection_count,
        }
    }

    #[test]
    fn first_broker_becomes_current_and_duplicates_are_ignored() {
        let reg = registry();
        reg.add("mqtt://a:1883");
        reg.add("mqtt://b:1883");
        reg.add("mqtt://a:1883");
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.current_uri().as_deref(), Some("mqtt://a:1883"));
    }

    #[test]
    fn add_then_remove_leaves_registry_unchanged() {
        let reg = registry();
        reg.add("mqtt://a:1883");
        let before = reg.uris();
        reg.add("mqtt://b:1883");
        reg.remove("mqtt://b:1883");
        assert_eq!(reg.uris(), before);
        assert_eq!(reg.current_uri().as_deref(), Some("mqtt://a:1883"));
    }

    #[test]
    fn removing_earlier_entry_shifts_current_left() {
        let reg = registry();
        reg.set_brokers(["a", "b", "c"]);
        assert!(reg.set_current("c"));
        reg.remove("a");
        assert_eq!(reg.current_uri().as_deref(), Some("c"));
    }

    #[test]
    fn removing_current_tail_clamps_to_last() {
        let reg = registry();
        reg.set_brokers(["a", "b", "c"]);
        assert!(reg.set_current("c"));
        reg.remove("c");
        assert_eq!(reg.current_uri().as_deref(), Some("b"));
    }

    #[test]
    fn set_brokers_preserves_order_and_drops_duplicates() {
        let reg = registry();
        reg.add("stale");
        reg.set_brokers(["x", "y", "x", "z", "y"]);
        assert_eq!(reg.uris(), vec!["x", "y", "z"]);
        assert_eq!(reg.current_uri().as_deref(), Some("x"));
    }

    #[test]
    fn set_current_rejects_unknown_uri() {
        let reg = registry();
        reg.add("a");
        assert!(!reg.set_current("b"));
        assert_eq!(reg.current_uri().as_deref(), Some("a"));
    }

    #[test]
    fn update_metrics_recomputes_score_and_stamps_last_check() {
        let reg = registry();
        reg.add("a");
        reg.update_metrics("a", metrics(50, 500_000, 50));
        let rec = reg.get("a").unwrap();
        assert!((rec.score - 0.5).abs() < 1e-9);
        let first = rec.last_check.unwrap();

        reg.update_metrics("a", metrics(10, 2_000_000, 10));
        let rec = reg.get("a").unwrap();
        assert!(rec.last_check.unwrap() >= first);
        assert!((0.0..=1.0).contains(&rec.score));
    }

    #[test]
    fn unavailable_broker_scores_zero_until_restored() {
        let reg = registry();
        reg.add("a");
        reg.update_metrics("a", metrics(10, 2_000_000, 10));
        let scored = reg.get("a").unwrap().score;
        assert!(scored > 0.0);

        reg.mark_unavailable("a");
        let rec = reg.get("a").unwrap();
        assert!(!rec.available);
        assert_eq!(rec.score, 0.0);

        // Metric updates while unavailable must not resurrect the score.
        reg.update_metrics("a", metrics(10, 2_000_000, 10));
        assert_eq!(reg.get("a").unwrap().score, 0.0);

        reg.mark_available("a");
        let rec = reg.get("a").unwrap();
        assert!(rec.available);
        assert!((rec.score - scored).abs() < 1e-9);
    }

    #[test]
    fn best_prefers_highest_score_with_registration_order_ties() {
        let reg = registry();
        reg.set_brokers(["a", "b", "c"]);
        reg.update_metrics("a", metrics(50, 500_000, 50));
        reg.update_metrics("b", metrics(50, 500_000, 50));
        reg.update_metrics("c", metrics(80, 100_000, 90));
        assert_eq!(reg.best().unwrap().uri, "a");

        reg.mark_unavailable("a");
        assert_eq!(reg.best().unwrap().uri, "b");

        reg.mark_unavailable("b");
        reg.mark_unavailable("c");
        assert!(reg.best().is_none());
    }

    #[test]
    fn should_switch_applies_hysteresis() {
        let reg = registry();
        reg.set_brokers(["b", "c"]);
        assert!(reg.set_current("b"));

        reg.update_metrics("b", metrics(50, 1_000_000, 50)); // 0.30 + 0.20 + 0.10 = 0.60
        reg.update_metrics("c", metrics(40, 1_000_000, 50)); // 0.36 + 0.20 + 0.10 = 0.66
        assert!(!reg.should_switch()); // 0.06 <= 0.10

        reg.update_metrics("c", metrics(20, 1_000_000, 40)); // 0.48 + 0.20 + 0.12 = 0.80
        assert!(reg.should_switch()); // 0.20 > 0.10
    }

    #[test]
    fn should_switch_is_false_when_best_is_current_or_pool_empty() {
        let reg = registry();
        assert!(!reg.should_switch());

        reg.add("a");
        reg.update_metrics("a", metrics(10, 2_000_000, 10));
        assert!(!reg.should_switch());
    }
}
