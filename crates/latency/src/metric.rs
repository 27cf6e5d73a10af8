/// Default cap on retained samples per tracker.
pub const DEFAULT_MAX_SAMPLES: usize = 1000;

/// Aggregated latency measurements for one named operation.
///
/// Aggregates are updated on every sample. The sample buffer, when retention
/// is enabled, is append-only until `max_samples` and drops anything after.
#[derive(Debug, Clone)]
pub struct LatencyMetric {
    name: String,
    min_ns: u64,
    max_ns: u64,
    sum_ns: u128,
    count: u64,
    samples: Vec<u64>,
    retain_samples: bool,
    max_samples: usize,
}

impl LatencyMetric {
    pub fn new(name: impl Into<String>, retain_samples: bool, max_samples: usize) -> Self {
        Self {
            name: name.into(),
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
            count: 0,
            samples: Vec::new(),
            retain_samples,
            max_samples,
        }
    }

    pub fn record(&mut self, latency_ns: u64) {
        self.min_ns = self.min_ns.min(latency_ns);
        self.max_ns = self.max_ns.max(latency_ns);
        self.sum_ns += u128::from(latency_ns);
        self.count += 1;

        if self.retain_samples && self.samples.len() < self.max_samples {
            self.samples.push(latency_ns);
        }
    }

    pub fn reset(&mut self) {
        self.min_ns = u64::MAX;
        self.max_ns = 0;
        self.sum_ns = 0;
        self.count = 0;
        self.samples.clear();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Smallest recorded latency, 0 if nothing was recorded.
    pub fn min_ns(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min_ns
        }
    }

    pub fn max_ns(&self) -> u64 {
        self.max_ns
    }

    pub fn sum_ns(&self) -> u128 {
        self.sum_ns
    }

    pub fn retains_samples(&self) -> bool {
        self.retain_samples
    }

    pub fn samples(&self) -> &[u64] {
        &self.samples
    }

    pub fn average_ns(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum_ns as f64 / self.count as f64
    }

    pub fn average_us(&self) -> f64 {
        self.average_ns() / 1_000.0
    }

    pub fn average_ms(&self) -> f64 {
        self.average_ns() / 1_000_000.0
    }

    /// Percentile over retained samples with linear interpolation between
    /// the floor and ceiling ranks. Sorting happens here, on read.
    pub fn percentile_ns(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let p = p.clamp(0.0, 100.0);
        let index = p * (sorted.len() - 1) as f64 / 100.0;
        let lower = index.floor() as usize;
        let upper = index.ceil() as usize;

        if lower == upper {
            return sorted[lower] as f64;
        }

        let weight = index - lower as f64;
        sorted[lower] as f64 * (1.0 - weight) + sorted[upper] as f64 * weight
    }

    /// Whether percentile columns carry data.
    pub fn has_percentiles(&self) -> bool {
        self.retain_samples && !self.samples.is_empty()
    }

    pub fn summary(&self) -> MetricSummary {
        let percentiles = self.has_percentiles().then(|| Percentiles {
            p50_ns: self.percentile_ns(50.0),
            p90_ns: self.percentile_ns(90.0),
            p99_ns: self.percentile_ns(99.0),
        });

        MetricSummary {
            name: self.name.clone(),
            count: self.count,
            min_ns: self.min_ns(),
            max_ns: self.max_ns,
            avg_ns: self.average_ns(),
            percentiles,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentiles {
    pub p50_ns: f64,
    pub p90_ns: f64,
    pub p99_ns: f64,
}

/// Point-in-time view of a metric, used by the exporters.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSummary {
    pub name: String,
    pub count: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: f64,
    pub percentiles: Option<Percentiles>,
}

impl MetricSummary {
    pub fn avg_us(&self) -> f64 {
        self.avg_ns / 1_000.0
    }

    pub fn avg_ms(&self) -> f64 {
        self.avg_ns / 1_000_000.0
    }
}
