//! Weighted broker scoring
//!
//! Pure scoring model: maps a broker's measured metrics and a category
//! weight profile to a scalar in [0, 1]. Stateless and deterministic so the
//! registry can recompute scores on every metric update without ordering
//! sensitivity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::registry::BrokerMetrics;

/// Latency above this many milliseconds contributes nothing to the score.
const LATENCY_BASELINE_MS: f64 = 100.0;
/// Throughput at or above this many bytes/second saturates the component.
const BANDWIDTH_BASELINE_BPS: f64 = 1_000_000.0;
/// Connection counts at or above this saturate the load penalty.
const CONNECTION_BASELINE: f64 = 100.0;

/// Relative importance of latency, bandwidth, and broker load.
///
/// Components are each in [0, 1] and sum to 1. A profile is selected once
/// per registry from the device category table and never changes afterwards;
/// it is re-applied on every metric update.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub struct WeightProfile {
    pub latency: f64,
    pub bandwidth: f64,
    pub connection: f64,
}

impl WeightProfile {
    const fn new(latency: f64, bandwidth: f64, connection: f64) -> Self {
        Self {
            latency,
            bandwidth,
            connection,
        }
    }
}

/// Device categories with fixed weight profiles.
///
/// The table encodes what each device class cares about: sensors favour
/// latency, cameras favour bandwidth, RFID readers favour lightly loaded
/// brokers. Unknown category names fall back to `Sensor`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceCategory {
    Sensor,
    Meter,
    Light,
    Appliance,
    Beacon,
    Camera,
    Signage,
    Wearable,
    Traffic,
    Drone,
    Rfid,
}

impl DeviceCategory {
    /// Weight profile for this category.
    pub fn weights(self) -> WeightProfile {
        match self {
            DeviceCategory::Sensor
            | DeviceCategory::Meter
            | DeviceCategory::Light
            | DeviceCategory::Appliance
            | DeviceCategory::Beacon => WeightProfile::new(0.6, 0.2, 0.2),
            DeviceCategory::Camera | DeviceCategory::Signage => WeightProfile::new(0.2, 0.6, 0.2),
            DeviceCategory::Wearable => WeightProfile::new(0.3, 0.4, 0.3),
            DeviceCategory::Traffic => WeightProfile::new(0.4, 0.2, 0.4),
            DeviceCategory::Drone => WeightProfile::new(0.3, 0.5, 0.2),
            DeviceCategory::Rfid => WeightProfile::new(0.3, 0.2, 0.5),
        }
    }
}

impl FromStr for DeviceCategory {
    type Err = std::convert::Infallible;

    // Unknown names resolve to Sensor rather than erroring.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "sensor" => DeviceCategory::Sensor,
            "meter" => DeviceCategory::Meter,
            "light" => DeviceCategory::Light,
            "appliance" => DeviceCategory::Appliance,
            "beacon" => DeviceCategory::Beacon,
            "camera" => DeviceCategory::Camera,
            "signage" => DeviceCategory::Signage,
            "wearable" => DeviceCategory::Wearable,
            "traffic" => DeviceCategory::Traffic,
            "drone" => DeviceCategory::Drone,
            "rfid" => DeviceCategory::Rfid,
            _ => DeviceCategory::Sensor,
        })
    }
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DeviceCategory::Sensor => "sensor",
            DeviceCategory::Meter => "meter",
            DeviceCategory::Light => "light",
            DeviceCategory::Appliance => "appliance",
            DeviceCategory::Beacon => "beacon",
            DeviceCategory::Camera => "camera",
            DeviceCategory::Signage => "signage",
            DeviceCategory::Wearable => "wearable",
            DeviceCategory::Traffic => "traffic",
            DeviceCategory::Drone => "drone",
            DeviceCategory::Rfid => "rfid",
        };
        write!(f, "{}", name)
    }
}

/// Computes the weighted score for a set of metrics.
///
/// Unmeasured metrics (value 0) contribute 0 to their component, so a broker
/// that has only been latency-probed is scored on latency alone. The result
/// stays in [0, 1] for any input.
pub fn score(metrics: &BrokerMetrics, weights: &WeightProfile) -> f64 {
    let latency_component = if metrics.latency_ms > 0 {
        (1.0 - metrics.latency_ms as f64 / LATENCY_BASELINE_MS).max(0.0)
    } else {
        0.0
    };

    let bandwidth_component = if metrics.bandwidth_bps > 0 {
        (metrics.bandwidth_bps as f64 / BANDWIDTH_BASELINE_BPS).min(1.0)
    } else {
        0.0
    };

    let connection_component = if metrics.connection_count > 0 {
        (1.0 - metrics.connection_count as f64 / CONNECTION_BASELINE).max(0.0)
    } else {
        0.0
    };

    weights.latency * latency_component
        + weights.bandwidth * bandwidth_component
        + weights.connection * connection_component
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(latency_ms: u64, bandwidth_bps: u64, connection_count: u64) -> BrokerMetrics {
        BrokerMetrics {
            latency_ms,
            bandwidth_bps,
            connection_count,
        }
    }

    #[test]
    fn category_table_matches_profiles() {
        assert_eq!(
            DeviceCategory::Sensor.weights(),
            WeightProfile::new(0.6, 0.2, 0.2)
        );
        assert_eq!(
            DeviceCategory::Camera.weights(),
            WeightProfile::new(0.2, 0.6, 0.2)
        );
        assert_eq!(
            DeviceCategory::Wearable.weights(),
            WeightProfile::new(0.3, 0.4, 0.3)
        );
        assert_eq!(
            DeviceCategory::Traffic.weights(),
            WeightProfile::new(0.4, 0.2, 0.4)
        );
        assert_eq!(
            DeviceCategory::Drone.weights(),
            WeightProfile::new(0.3, 0.5, 0.2)
        );
        assert_eq!(
            DeviceCategory::Rfid.weights(),
            WeightProfile::new(0.3, 0.2, 0.5)
        );
    }

    #[test]
    fn unknown_category_falls_back_to_sensor() {
        let cat: DeviceCategory = "submarine".parse().unwrap();
        assert_eq!(cat, DeviceCategory::Sensor);
        let cat: DeviceCategory = "CAMERA".parse().unwrap();
        assert_eq!(cat, DeviceCategory::Camera);
    }

    #[test]
    fn balanced_metrics_score_half_under_any_profile() {
        // latency 50 -> 0.5, bandwidth 500k -> 0.5, connections 50 -> 0.5
        let m = metrics(50, 500_000, 50);
        let camera = score(&m, &DeviceCategory::Camera.weights());
        let sensor = score(&m, &DeviceCategory::Sensor.weights());
        assert!((camera - 0.5).abs() < 1e-9);
        assert!((sensor - 0.5).abs() < 1e-9);
    }

    #[test]
    fn fast_broker_scores_high_for_camera() {
        // components 0.9 / 1.0 / 0.9 under camera weights -> 0.96
        let m = metrics(10, 2_000_000, 10);
        let s = score(&m, &DeviceCategory::Camera.weights());
        assert!((s - 0.96).abs() < 1e-9);
    }

    #[test]
    fn unmeasured_metrics_contribute_nothing() {
        let s = score(&metrics(0, 0, 0), &DeviceCategory::Sensor.weights());
        assert_eq!(s, 0.0);

        let s = score(&metrics(50, 0, 0), &DeviceCategory::Sensor.weights());
        assert!((s - 0.6 * 0.5).abs() < 1e-9);
    }

    #[test]
    fn score_is_clamped_to_unit_interval() {
        // Saturated metrics must not push the score past the baselines.
        let s = score(&metrics(1_000, 50_000_000, 5_000), &DeviceCategory::Wearable.weights());
        assert!((0.0..=1.0).contains(&s));
        assert!((s - 0.4).abs() < 1e-9); // only the bandwidth component survives
    }
}
