//! Metrics for the attest provider
//!
//! Counters, gauges and latency histograms kept in process and rendered in
//! the Prometheus text exposition format at `GET /metrics`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::domain::Outcome;

/// Latency buckets in seconds; a validation may include TUF refreshes and
/// several registry round trips.
const LATENCY_BUCKETS: [f64; 12] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0,
];

enum Metric {
    Counter(AtomicU64),
    Gauge(AtomicU64),
    Histogram(Histogram),
}

impl Metric {
    fn kind(&self) -> &'static str {
        match self {
            Metric::Counter(_) => "counter",
            Metric::Gauge(_) => "gauge",
            Metric::Histogram(_) => "histogram",
        }
    }
}

/// Process-wide metrics registry, keyed by dotted metric name
pub struct MetricsRegistry {
    families: RwLock<BTreeMap<String, Arc<Metric>>>,
    started: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            families: RwLock::new(BTreeMap::new()),
            started: Instant::now(),
        }
    }

    /// Existing metric under `name`, or a new one from `create`.
    ///
    /// A name registered as another kind keeps its first kind.
    async fn metric(&self, name: &str, create: impl FnOnce() -> Metric) -> Arc<Metric> {
        if let Some(existing) = self.families.read().await.get(name) {
            return Arc::clone(existing);
        }
        let mut families = self.families.write().await;
        Arc::clone(
            families
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(create())),
        )
    }

    async fn load(&self, name: &str) -> Option<Arc<Metric>> {
        self.families.read().await.get(name).cloned()
    }

    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    pub async fn add_counter(&self, name: &str, value: u64) {
        let metric = self.metric(name, || Metric::Counter(AtomicU64::new(0))).await;
        if let Metric::Counter(total) = metric.as_ref() {
            total.fetch_add(value, Ordering::Relaxed);
        }
    }

    pub async fn set_gauge(&self, name: &str, value: u64) {
        let metric = self.metric(name, || Metric::Gauge(AtomicU64::new(0))).await;
        if let Metric::Gauge(current) = metric.as_ref() {
            current.store(value, Ordering::Relaxed);
        }
    }

    /// Record one latency observation in seconds
    pub async fn observe_histogram(&self, name: &str, seconds: f64) {
        let metric = self
            .metric(name, || Metric::Histogram(Histogram::new(&LATENCY_BUCKETS)))
            .await;
        if let Metric::Histogram(histogram) = metric.as_ref() {
            histogram.observe(seconds);
        }
    }

    /// Counter value, 0 when never incremented
    pub async fn get_counter(&self, name: &str) -> u64 {
        match self.load(name).await.as_deref() {
            Some(Metric::Counter(total)) => total.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub async fn get_gauge(&self, name: &str) -> u64 {
        match self.load(name).await.as_deref() {
            Some(Metric::Gauge(current)) => current.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    /// Count one verification outcome
    pub async fn record_outcome(&self, outcome: Outcome) {
        let name = match outcome {
            Outcome::Success => metric_names::OUTCOME_SUCCESS,
            Outcome::Failure => metric_names::OUTCOME_FAILURE,
            Outcome::NoPolicy => metric_names::OUTCOME_NO_POLICY,
        };
        self.inc_counter(name).await;
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Render every metric in the Prometheus text format
    pub async fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# HELP attest_provider_uptime_seconds Time since service start");
        let _ = writeln!(out, "# TYPE attest_provider_uptime_seconds gauge");
        let _ = writeln!(out, "attest_provider_uptime_seconds {}", self.uptime_seconds());

        for (name, metric) in self.families.read().await.iter() {
            let exported = exported_name(name);
            let _ = writeln!(out, "# TYPE {exported} {}", metric.kind());
            match metric.as_ref() {
                Metric::Counter(value) | Metric::Gauge(value) => {
                    let _ = writeln!(out, "{exported} {}", value.load(Ordering::Relaxed));
                }
                Metric::Histogram(histogram) => histogram.render(&exported, &mut out),
            }
        }
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn exported_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Fixed-bucket histogram
pub struct Histogram {
    bounds: Vec<f64>,
    /// Per-bucket (non-cumulative) hits
    hits: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    observations: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            hits: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            observations: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, seconds: f64) {
        self.observations.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds.max(0.0) * 1e6) as u64, Ordering::Relaxed);
        if let Some(slot) = self.bounds.iter().position(|bound| seconds <= *bound) {
            self.hits[slot].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn observations(&self) -> u64 {
        self.observations.load(Ordering::Relaxed)
    }

    fn render(&self, exported: &str, out: &mut String) {
        let mut running = 0;
        for (bound, hits) in self.bounds.iter().zip(&self.hits) {
            running += hits.load(Ordering::Relaxed);
            let _ = writeln!(out, "{exported}_bucket{{le=\"{bound}\"}} {running}");
        }
        let total = self.observations();
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6;
        let _ = writeln!(out, "{exported}_bucket{{le=\"+Inf\"}} {total}");
        let _ = writeln!(out, "{exported}_sum {sum}");
        let _ = writeln!(out, "{exported}_count {total}");
    }
}

/// Metric names used by the handlers and the listener
pub mod metric_names {
    pub const VALIDATE_REQUESTS: &str = "attest_provider.validate.requests";
    pub const MUTATE_REQUESTS: &str = "attest_provider.mutate.requests";
    pub const KEYS_RECEIVED: &str = "attest_provider.keys.received";

    pub const OUTCOME_SUCCESS: &str = "attest_provider.outcome.success";
    pub const OUTCOME_FAILURE: &str = "attest_provider.outcome.failure";
    pub const OUTCOME_NO_POLICY: &str = "attest_provider.outcome.no_policy";

    pub const SYSTEM_ERRORS: &str = "attest_provider.errors.system";
    pub const VERIFIER_BUILD_ERRORS: &str = "attest_provider.errors.verifier_build";
    pub const TIMEOUTS: &str = "attest_provider.errors.timeout";

    pub const VALIDATE_LATENCY: &str = "attest_provider.validate.latency_seconds";
    pub const MUTATE_LATENCY: &str = "attest_provider.mutate.latency_seconds";

    pub const ACTIVE_CONNECTIONS: &str = "attest_provider.connections.active";
}

/// Await `work` and record how long it took under `metric_name`
pub async fn timed<F, T>(metrics: &MetricsRegistry, metric_name: &str, work: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let began = Instant::now();
    let output = work.await;
    metrics
        .observe_histogram(metric_name, began.elapsed().as_secs_f64())
        .await;
    output
}
