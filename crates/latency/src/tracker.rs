use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use quanta::Clock;
use tracing::warn;

use crate::metric::{LatencyMetric, MetricSummary};

struct TrackerState {
    metric: LatencyMetric,
    pending: HashMap<u64, u64>,
}

/// Start/end latency tracker for a single named operation.
///
/// `start()` hands out ids that are unique within this tracker only. The
/// matching `end(id)` consumes the pending start; a second `end` for the same
/// id is logged and ignored.
pub struct LatencyTracker {
    name: String,
    clock: Clock,
    next_id: AtomicU64,
    state: Mutex<TrackerState>,
}

impl LatencyTracker {
    pub fn new(name: impl Into<String>, clock: Clock, retain_samples: bool, max_samples: usize) -> Self {
        let name = name.into();
        Self {
            name: name.clone(),
            clock,
            next_id: AtomicU64::new(1),
            state: Mutex::new(TrackerState {
                metric: LatencyMetric::new(name, retain_samples, max_samples),
                pending: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) -> u64 {
        let now = self.clock.raw();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().pending.insert(id, now);
        id
    }

    /// Returns the recorded latency, or `None` when `id` has no pending start.
    pub fn end(&self, id: u64) -> Option<u64> {
        let now = self.clock.raw();
        let mut state = self.lock();
        let Some(started) = state.pending.remove(&id) else {
            drop(state);
            warn!(tracker = %self.name, id, "no start time found for latency id");
            return None;
        };
        let elapsed = self.clock.delta(started, now).as_nanos() as u64;
        state.metric.record(elapsed);
        Some(elapsed)
    }

    /// Record an externally measured latency.
    pub fn record_ns(&self, latency_ns: u64) {
        self.lock().metric.record(latency_ns);
    }

    /// Drop a pending start without recording it.
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Time a closure.
    pub fn time<T>(&self, f: impl FnOnce() -> T) -> T {
        let id = self.start();
        let out = f();
        self.end(id);
        out
    }

    /// RAII guard that records on drop.
    pub fn scoped(self: &Arc<Self>) -> ScopedLatency {
        ScopedLatency {
            id: Some(self.start()),
            tracker: Arc::clone(self),
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn metric(&self) -> LatencyMetric {
        self.lock().metric.clone()
    }

    pub fn summary(&self) -> MetricSummary {
        self.lock().metric.summary()
    }

    pub fn reset(&self) {
        self.lock().metric.reset();
    }
}

impl std::fmt::Debug for LatencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyTracker")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Records the elapsed time between construction and drop.
#[must_use = "latency is recorded when the guard is dropped"]
pub struct ScopedLatency {
    tracker: Arc<LatencyTracker>,
    id: Option<u64>,
}

impl ScopedLatency {
    /// Discard the measurement.
    pub fn cancel(mut self) {
        if let Some(id) = self.id.take() {
            self.tracker.cancel(id);
        }
    }
}

impl Drop for ScopedLatency {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.tracker.end(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::DEFAULT_MAX_SAMPLES;

    fn mock_tracker() -> (Arc<LatencyTracker>, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        (
            Arc::new(LatencyTracker::new("test", clock, true, DEFAULT_MAX_SAMPLES)),
            mock,
        )
    }

    #[test]
    fn test_start_end_records_elapsed() {
        let (tracker, mock) = mock_tracker();
        let id = tracker.start();
        mock.increment(1_500);
        assert_eq!(tracker.end(id), Some(1_500));

        let m = tracker.metric();
        assert_eq!(m.count(), 1);
        assert_eq!(m.min_ns(), 1_500);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_ids_are_monotonic_per_tracker() {
        let (a, _) = mock_tracker();
        let (b, _) = mock_tracker();
        let a1 = a.start();
        let a2 = a.start();
        assert!(a2 > a1);
        // independent sequence
        assert_eq!(b.start(), a1);
    }

    #[test]
    fn test_unknown_or_consumed_id_is_noop() {
        let (tracker, _) = mock_tracker();
        assert_eq!(tracker.end(42), None);

        let id = tracker.start();
        assert!(tracker.end(id).is_some());
        assert_eq!(tracker.end(id), None);
        assert_eq!(tracker.metric().count(), 1);
    }

    #[test]
    fn test_scoped_guard_records_on_drop() {
        let (tracker, mock) = mock_tracker();
        {
            let _guard = tracker.scoped();
            mock.increment(250);
        }
        assert_eq!(tracker.metric().samples(), &[250]);
    }

    #[test]
    fn test_scoped_guard_cancel() {
        let (tracker, _) = mock_tracker();
        let guard = tracker.scoped();
        guard.cancel();
        assert_eq!(tracker.metric().count(), 0);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_overlapping_measurements() {
        let (tracker, mock) = mock_tracker();
        let first = tracker.start();
        mock.increment(100);
        let second = tracker.start();
        mock.increment(50);
        tracker.end(second);
        tracker.end(first);

        let m = tracker.metric();
        assert_eq!(m.min_ns(), 50);
        assert_eq!(m.max_ns(), 150);
    }

    #[test]
    fn test_time_closure() {
        let (tracker, _) = mock_tracker();
        let v = tracker.time(|| 7);
        assert_eq!(v, 7);
        assert_eq!(tracker.metric().count(), 1);
    }
}
