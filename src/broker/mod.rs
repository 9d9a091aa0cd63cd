//! # Broker Pool Model
//!
//! Holds the data model for the candidate broker pool: per-broker metric
//! records, the weighted scoring function, and the thread-safe registry the
//! monitor and session manager share.
//!
//! ## Module Architecture
//!
//! ```text
//! broker/
//! ├── score.rs    - weight profiles, device categories, scoring function
//! └── registry.rs - broker records, selection predicates, current marker
//! ```
//!
//! The registry is the single coordination point between the measurement
//! side (monitor writes metrics) and the decision side (session manager
//! reads `best()` / `should_switch()`). All mutation is serialized behind
//! one mutex; callers only ever see cloned snapshots.

pub mod registry;
pub mod score;

pub use registry::{BrokerMetrics, BrokerRecord, BrokerRegistry};
pub use score::{score, DeviceCategory, WeightProfile};
