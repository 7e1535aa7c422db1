//! Observability: trace ids, latency windows and event counters.
//! Latency windows keep the most recent samples and report p50/p95/p99.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

const DEFAULT_WINDOW: usize = 1024;

/// Fresh id for a batch or a single request, carried in tracing fields.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Measures one operation; the sample is recorded by [`LatencyTimer::finish`].
/// A timer dropped without finishing records nothing, so failed calls do not
/// skew the latency window.
pub struct LatencyTimer {
    metric: &'static str,
    started: Instant,
    registry: Arc<MetricsRegistry>,
}

impl LatencyTimer {
    /// Record the elapsed time and return it in microseconds.
    pub fn finish(self) -> f64 {
        let micros = self.started.elapsed().as_micros() as f64;
        self.registry.record(self.metric, micros);
        micros
    }
}

/// Bounded window of latency samples, oldest dropped first.
struct Window {
    samples: VecDeque<f64>,
    limit: usize,
}

impl Window {
    fn new(limit: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(limit),
            limit,
        }
    }

    fn push(&mut self, sample: f64) {
        if self.samples.len() == self.limit {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn quantile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut ordered: Vec<f64> = self.samples.iter().copied().collect();
        ordered.sort_by(f64::total_cmp);
        let last = ordered.len() - 1;
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * last as f64).round() as usize;
        ordered[rank.min(last)]
    }

    fn summary(&self) -> LatencySummary {
        LatencySummary {
            p50_us: self.quantile(50.0),
            p95_us: self.quantile(95.0),
            p99_us: self.quantile(99.0),
            count: self.samples.len(),
        }
    }
}

#[derive(Default)]
struct Tables {
    windows: HashMap<&'static str, Window>,
    counters: HashMap<&'static str, u64>,
}

/// Shared registry for the service, the batcher and the binary's report.
pub struct MetricsRegistry {
    tables: Mutex<Tables>,
    window: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WINDOW)
    }

    /// Registry whose latency windows keep at most `window` samples.
    pub fn with_capacity(window: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            window: window.max(1),
        }
    }

    /// Add a latency sample in microseconds.
    pub fn record(&self, metric: &'static str, micros: f64) {
        let limit = self.window;
        self.tables
            .lock()
            .windows
            .entry(metric)
            .or_insert_with(|| Window::new(limit))
            .push(micros);
        tracing::trace!(metric, micros, "latency sample");
    }

    pub fn increment(&self, metric: &'static str) {
        *self.tables.lock().counters.entry(metric).or_default() += 1;
    }

    pub fn count(&self, metric: &str) -> u64 {
        self.tables.lock().counters.get(metric).copied().unwrap_or(0)
    }

    pub fn span(self: &Arc<Self>, metric: &'static str) -> LatencyTimer {
        LatencyTimer {
            metric,
            started: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    /// Percentile `p` (0-100) of a latency metric in microseconds; 0 when unseen.
    pub fn percentile(&self, metric: &str, p: f64) -> f64 {
        self.tables
            .lock()
            .windows
            .get(metric)
            .map_or(0.0, |w| w.quantile(p))
    }

    /// Every latency metric, ordered by name.
    pub fn summary(&self) -> BTreeMap<&'static str, LatencySummary> {
        self.tables
            .lock()
            .windows
            .iter()
            .map(|(&metric, window)| (metric, window.summary()))
            .collect()
    }

    /// Every counter, ordered by name.
    pub fn counters(&self) -> BTreeMap<&'static str, u64> {
        self.tables
            .lock()
            .counters
            .iter()
            .map(|(&metric, &n)| (metric, n))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

pub mod metric_names {
    pub const REMOTE_CALL: &str = "latency.remote_call";
    pub const TRANSLATE_DONE: &str = "latency.translate";
    pub const SLOT_WAIT: &str = "latency.slot_wait";
    pub const BATCH_CHUNK: &str = "latency.batch_chunk";
    pub const BATCH_DONE: &str = "latency.batch";
    pub const CACHE_HIT: &str = "count.cache_hit";
    pub const CACHE_MISS: &str = "count.cache_miss";
    pub const REMOTE_ERROR: &str = "count.remote_error";
    pub const BATCH_ABORTED: &str = "count.batch_aborted";
}
