//! In-process metrics for long-running edge services
//!
//! Counters and gauges are plain atomics. Histograms keep a bounded window of
//! recent observations so that a process serving connections for months does
//! not grow without limit. Every update also emits a `debug!` event, which
//! makes metric changes visible in the log at `edge_core=debug`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Number of observations a histogram retains
pub const HISTOGRAM_WINDOW: usize = 4096;

/// A counter metric that can only increase
#[derive(Clone)]
pub struct Counter {
    name: Arc<str>,
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, value: u64) {
        let total = self.value.fetch_add(value, Ordering::Relaxed) + value;
        debug!(metric = "counter", name = %self.name, value, total, "Counter incremented");
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge metric that can increase or decrease
#[derive(Clone)]
pub struct Gauge {
    name: Arc<str>,
    value: Arc<AtomicI64>,
}

impl Gauge {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
        debug!(metric = "gauge", name = %self.name, value, "Gauge set");
    }

    pub fn increment(&self) {
        let value = self.value.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(metric = "gauge", name = %self.name, value, "Gauge incremented");
    }

    pub fn decrement(&self) {
        let value = self.value.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(metric = "gauge", name = %self.name, value, "Gauge decremented");
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Summary statistics over a histogram's retained window
#[derive(Debug, Clone)]
pub struct HistogramStats {
    /// Observations ever recorded, including ones evicted from the window
    pub count: u64,
    /// Sum of all observations ever recorded
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

#[derive(Default)]
struct HistogramState {
    window: VecDeque<f64>,
    count: u64,
    sum: f64,
}

/// A histogram metric, typically for durations in seconds
#[derive(Clone)]
pub struct Histogram {
    name: Arc<str>,
    state: Arc<RwLock<HistogramState>>,
}

impl Histogram {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(HistogramState::default())),
        }
    }

    pub fn observe(&self, value: f64) {
        if let Ok(mut state) = self.state.write() {
            if state.window.len() == HISTOGRAM_WINDOW {
                state.window.pop_front();
            }
            state.window.push_back(value);
            state.count += 1;
            state.sum += value;
        }
        debug!(metric = "histogram", name = %self.name, value, "Histogram observation recorded");
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    /// Statistics for the histogram, `None` before the first observation
    pub fn stats(&self) -> Option<HistogramStats> {
        let state = self.state.read().ok()?;
        if state.window.is_empty() {
            return None;
        }

        let mut sorted: Vec<f64> = state.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        let len = sorted.len();
        let percentile = |p: usize| sorted[(len - 1) * p / 100];
        let windowed_sum: f64 = sorted.iter().sum();

        Some(HistogramStats {
            count: state.count,
            sum: state.sum,
            mean: windowed_sum / len as f64,
            min: sorted[0],
            max: sorted[len - 1],
            p50: percentile(50),
            p90: percentile(90),
            p99: percentile(99),
        })
    }
}

/// Metrics registry
pub struct Metrics {
    counters: RwLock<HashMap<String, Counter>>,
    gauges: RwLock<HashMap<String, Gauge>>,
    histograms: RwLock<HashMap<String, Histogram>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create a counter
    pub fn counter(&self, name: &str) -> Counter {
        get_or_insert(&self.counters, name, Counter::new)
    }

    /// Get or create a gauge
    pub fn gauge(&self, name: &str) -> Gauge {
        get_or_insert(&self.gauges, name, Gauge::new)
    }

    /// Get or create a histogram
    pub fn histogram(&self, name: &str) -> Histogram {
        get_or_insert(&self.histograms, name, Histogram::new)
    }

    /// Log all metrics at info level
    pub fn log_all(&self) {
        for (name, value) in self.all_counters() {
            info!(metric_type = "counter", metric_name = %name, value, "Metric value");
        }
        for (name, value) in self.all_gauges() {
            info!(metric_type = "gauge", metric_name = %name, value, "Metric value");
        }
        for (name, stats) in self.all_histograms() {
            info!(
                metric_type = "histogram",
                metric_name = %name,
                count = stats.count,
                mean = stats.mean,
                p50 = stats.p50,
                p99 = stats.p99,
                "Metric value"
            );
        }
    }

    pub fn all_counters(&self) -> HashMap<String, u64> {
        self.counters
            .read()
            .map(|counters| counters.iter().map(|(k, v)| (k.clone(), v.get())).collect())
            .unwrap_or_default()
    }

    pub fn all_gauges(&self) -> HashMap<String, i64> {
        self.gauges
            .read()
            .map(|gauges| gauges.iter().map(|(k, v)| (k.clone(), v.get())).collect())
            .unwrap_or_default()
    }

    pub fn all_histograms(&self) -> HashMap<String, HistogramStats> {
        self.histograms
            .read()
            .map(|histograms| {
                histograms
                    .iter()
                    .filter_map(|(k, v)| v.stats().map(|stats| (k.clone(), stats)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn get_or_insert<T: Clone>(
    map: &RwLock<HashMap<String, T>>,
    name: &str,
    create: impl FnOnce(&str) -> T,
) -> T {
    if let Ok(entries) = map.read()
        && let Some(existing) = entries.get(name)
    {
        return existing.clone();
    }

    let created = create(name);
    match map.write() {
        // Another writer may have won the race between the two locks.
        Ok(mut entries) => entries
            .entry(name.to_string())
            .or_insert(created)
            .clone(),
        Err(_) => created,
    }
}

lazy_static::lazy_static! {
    pub(crate) static ref GLOBAL_METRICS: Metrics = Metrics::new();
}

/// Get or create a global counter
pub fn counter(name: &str) -> Counter {
    GLOBAL_METRICS.counter(name)
}

/// Get or create a global gauge
pub fn gauge(name: &str) -> Gauge {
    GLOBAL_METRICS.gauge(name)
}

/// Get or create a global histogram
pub fn histogram(name: &str) -> Histogram {
    GLOBAL_METRICS.histogram(name)
}

/// Log all global metrics
pub fn log_all_metrics() {
    GLOBAL_METRICS.log_all();
}

/// The global metrics instance
pub fn global() -> &'static Metrics {
    &GLOBAL_METRICS
}

/// Records the elapsed time into a histogram when dropped
pub struct Timer {
    histogram: Histogram,
    start: Instant,
}

impl Timer {
    pub fn new(histogram: Histogram) -> Self {
        Self {
            histogram,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.histogram.observe_duration(self.start.elapsed());
    }
}
