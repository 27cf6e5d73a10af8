//! relay-latency: named latency trackers
//!
//! A `LatencyRegistry` owns a set of `LatencyTracker`s keyed by operation
//! name. Trackers aggregate min/max/sum/count and keep a capped sample buffer
//! for percentiles. Timestamps come from a TSC-backed `quanta::Clock`.

pub mod error;
pub mod export;
pub mod metric;
pub mod registry;
pub mod tracker;

pub use error::LatencyError;
pub use export::CSV_HEADER;
pub use metric::{LatencyMetric, MetricSummary, Percentiles, DEFAULT_MAX_SAMPLES};
pub use registry::LatencyRegistry;
pub use tracker::{LatencyTracker, ScopedLatency};
