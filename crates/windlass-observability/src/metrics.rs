//! Workflow and node metrics
//!
//! A small metrics surface: named counters and duration histograms with
//! percentile summaries, plus a pluggable exporter for snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Maximum samples retained per histogram
///
/// Older samples are dropped once the window is full, keeping percentile
/// summaries representative of recent behavior.
const HISTOGRAM_WINDOW: usize = 4096;

/// Percentile summary of a histogram
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Number of recorded samples (lifetime)
    pub count: u64,

    /// Minimum sample in the window, milliseconds
    pub min_ms: f64,

    /// Maximum sample in the window, milliseconds
    pub max_ms: f64,

    /// Median, milliseconds
    pub p50_ms: f64,

    /// 95th percentile, milliseconds
    pub p95_ms: f64,

    /// 99th percentile, milliseconds
    pub p99_ms: f64,
}

struct Histogram {
    samples: Vec<f64>,
    next: usize,
    count: u64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            samples: Vec::new(),
            next: 0,
            count: 0,
        }
    }

    fn record(&mut self, value_ms: f64) {
        self.count += 1;
        if self.samples.len() < HISTOGRAM_WINDOW {
            self.samples.push(value_ms);
        } else {
            self.samples[self.next] = value_ms;
            self.next = (self.next + 1) % HISTOGRAM_WINDOW;
        }
    }

    fn summary(&self) -> Option<HistogramSummary> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let percentile = |p: f64| -> f64 {
            let rank = (p * (sorted.len() - 1) as f64).round() as usize;
            sorted[rank.min(sorted.len() - 1)]
        };

        Some(HistogramSummary {
            count: self.count,
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            p99_ms: percentile(0.99),
        })
    }
}

/// Point-in-time view of all metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Counter values by name
    pub counters: BTreeMap<String, u64>,

    /// Histogram summaries by name
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Accumulates counters and histograms
///
/// Counter and histogram names are free-form; the engine uses a canonical
/// set (see the `names` module) so exporters and dashboards can rely on
/// stable keys.
///
/// # Example
///
/// ```
/// use windlass_observability::MetricsRegistry;
/// use std::time::Duration;
///
/// let metrics = MetricsRegistry::new();
/// metrics.increment("workflow.runs.completed");
/// metrics.record_duration("node.duration.fetch", Duration::from_millis(12));
///
/// let snapshot = metrics.snapshot();
/// assert_eq!(snapshot.counters["workflow.runs.completed"], 1);
/// ```
#[derive(Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, u64>>,
    histograms: Mutex<BTreeMap<String, Histogram>>,
}

impl MetricsRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one
    pub fn increment(&self, name: impl Into<String>) {
        self.add(name, 1);
    }

    /// Add to a counter
    pub fn add(&self, name: impl Into<String>, delta: u64) {
        let mut counters = self.counters.write();
        *counters.entry(name.into()).or_insert(0) += delta;
    }

    /// Record a duration sample into a histogram
    pub fn record_duration(&self, name: impl Into<String>, duration: Duration) {
        let mut histograms = self.histograms.lock();
        histograms
            .entry(name.into())
            .or_insert_with(Histogram::new)
            .record(duration.as_secs_f64() * 1000.0);
    }

    /// Current value of a counter (0 when never written)
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    /// Percentile summary for a histogram
    pub fn histogram(&self, name: &str) -> Option<HistogramSummary> {
        self.histograms.lock().get(name).and_then(Histogram::summary)
    }

    /// Snapshot every counter and histogram
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.read().clone();
        let histograms = self
            .histograms
            .lock()
            .iter()
            .filter_map(|(name, h)| h.summary().map(|s| (name.clone(), s)))
            .collect();
        MetricsSnapshot {
            counters,
            histograms,
        }
    }

    /// Reset all metrics (for tests)
    pub fn clear(&self) {
        self.counters.write().clear();
        self.histograms.lock().clear();
    }
}

/// Canonical metric names emitted by the engine
pub mod names {
    /// Runs entering a terminal status; suffixed with the status
    pub const RUNS_BY_STATUS: &str = "workflow.runs";

    /// Per-node execution duration; suffixed with the node name
    pub const NODE_DURATION: &str = "workflow.node.duration";

    /// Retry attempts beyond the first
    pub const RETRIES: &str = "workflow.node.retries";

    /// Circuit breaker state transitions; suffixed with the new state
    pub const BREAKER_TRANSITIONS: &str = "workflow.breaker.transitions";

    /// Tokens consumed by model-backed nodes
    pub const TOKENS: &str = "workflow.tokens";

    /// Accumulated cost in micro-units
    pub const COST_MICROS: &str = "workflow.cost_micros";
}

/// Ships metric snapshots somewhere
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    /// Exporter name (for logging)
    fn name(&self) -> &'static str;

    /// Export a snapshot
    async fn export(&self, snapshot: MetricsSnapshot) -> Result<(), MetricsExportError>;
}

/// Errors that can occur during metrics export
#[derive(Debug, thiserror::Error)]
pub enum MetricsExportError {
    /// Transport failure
    #[error("transport error: {0}")]
    Transport(String),
}

/// Text exporter writing the snapshot to stdout
#[derive(Debug, Default)]
pub struct ConsoleMetricsExporter;

impl ConsoleMetricsExporter {
    /// Create a console metrics exporter
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricsExporter for ConsoleMetricsExporter {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn export(&self, snapshot: MetricsSnapshot) -> Result<(), MetricsExportError> {
        for (name, value) in &snapshot.counters {
            println!("[metric] {name} = {value}");
        }
        for (name, summary) in &snapshot.histograms {
            println!(
                "[metric] {name} count={} p50={:.1}ms p95={:.1}ms p99={:.1}ms",
                summary.count, summary.p50_ms, summary.p95_ms, summary.p99_ms
            );
        }
        Ok(())
    }
}

// Process-wide registry mirroring the global tracer lifecycle.
static GLOBAL_METRICS: RwLock<Option<Arc<MetricsRegistry>>> = RwLock::new(None);

/// Install the process-wide metrics registry
pub fn init_global_metrics(metrics: Arc<MetricsRegistry>) -> Option<Arc<MetricsRegistry>> {
    GLOBAL_METRICS.write().replace(metrics)
}

/// Get the process-wide metrics registry, if installed
pub fn global_metrics() -> Option<Arc<MetricsRegistry>> {
    GLOBAL_METRICS.read().clone()
}

/// Remove the process-wide metrics registry
pub fn shutdown_global_metrics() -> Option<Arc<MetricsRegistry>> {
    GLOBAL_METRICS.write().take()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let metrics = MetricsRegistry::new();
        metrics.increment("runs.completed");
        metrics.increment("runs.completed");
        metrics.add("runs.completed", 3);

        assert_eq!(metrics.counter("runs.completed"), 5);
        assert_eq!(metrics.counter("runs.failed"), 0);
    }

    #[test]
    fn test_histogram_percentiles() {
        let metrics = MetricsRegistry::new();
        for ms in 1..=100u64 {
            metrics.record_duration("node.duration", Duration::from_millis(ms));
        }

        let summary = metrics.histogram("node.duration").unwrap();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min_ms, 1.0);
        assert_eq!(summary.max_ms, 100.0);
        assert!((summary.p50_ms - 50.0).abs() <= 2.0);
        assert!(summary.p95_ms >= 94.0);
        assert!(summary.p99_ms >= 98.0);
    }

    #[test]
    fn test_histogram_window_bounds_memory() {
        let metrics = MetricsRegistry::new();
        for _ in 0..(HISTOGRAM_WINDOW + 500) {
            metrics.record_duration("d", Duration::from_millis(5));
        }
        let summary = metrics.histogram("d").unwrap();
        assert_eq!(summary.count, (HISTOGRAM_WINDOW + 500) as u64);
        assert_eq!(summary.p50_ms, 5.0);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let metrics = MetricsRegistry::new();
        metrics.increment("a");
        metrics.record_duration("b", Duration::from_millis(10));

        let snapshot = metrics.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot, parsed);
    }

    #[test]
    fn test_empty_histogram_has_no_summary() {
        let metrics = MetricsRegistry::new();
        assert!(metrics.histogram("missing").is_none());
    }

    #[tokio::test]
    async fn test_console_exporter_accepts_snapshot() {
        let metrics = MetricsRegistry::new();
        metrics.increment("runs.completed");
        ConsoleMetricsExporter::new()
            .export(metrics.snapshot())
            .await
            .unwrap();
    }
}
