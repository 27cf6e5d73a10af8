use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use quanta::Clock;

use crate::metric::{MetricSummary, DEFAULT_MAX_SAMPLES};
use crate::tracker::LatencyTracker;

/// Named latency trackers for one process.
///
/// Constructed explicitly and shared as `Arc<LatencyRegistry>`; every
/// component that measures latency receives it at construction time.
pub struct LatencyRegistry {
    clock: Clock,
    trackers: RwLock<BTreeMap<String, Arc<LatencyTracker>>>,
}

impl LatencyRegistry {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            trackers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Get or create a tracker with sample retention enabled.
    pub fn tracker(&self, name: &str) -> Arc<LatencyTracker> {
        self.tracker_with(name, true, DEFAULT_MAX_SAMPLES)
    }

    /// Get or create a tracker. Settings only apply on creation.
    pub fn tracker_with(&self, name: &str, retain_samples: bool, max_samples: usize) -> Arc<LatencyTracker> {
        if let Some(existing) = self.read().get(name) {
            return Arc::clone(existing);
        }

        let mut trackers = self
            .trackers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(trackers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(LatencyTracker::new(
                name,
                self.clock.clone(),
                retain_samples,
                max_samples,
            ))
        }))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<LatencyTracker>>> {
        self.trackers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn get(&self, name: &str) -> Option<MetricSummary> {
        self.read().get(name).map(|t| t.summary())
    }

    /// Summaries for every tracker, ordered by name.
    pub fn snapshot(&self) -> Vec<MetricSummary> {
        self.read().values().map(|t| t.summary()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn reset(&self, name: &str) {
        if let Some(t) = self.read().get(name) {
            t.reset();
        }
    }

    pub fn reset_all(&self) {
        for t in self.read().values() {
            t.reset();
        }
    }
}

impl Default for LatencyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
