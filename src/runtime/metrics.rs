// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prometheus-compatible metrics for the call pipeline.
//!
//! The collector is in-process: counters and gauges live in atomics and
//! [`MetricsCollector::to_prometheus_text`] renders them in the text
//! exposition format for whatever scrape endpoint the application runs.
//!
//! # Metrics
//!
//! - `requests_total{operation,status}` and `request_duration_seconds{operation}`
//! - `retries_total{operation}` and `rate_limited_total{operation}`
//! - `circuit_breaker_state{operation}` and `circuit_breaker_rejections_total`
//! - `live_endpoints{service}`
//! - `uptime_seconds`
//!
//! # Example
//!
//! ```rust
//! use resilient_rpc::runtime::{MetricsCollector, MetricsConfig};
//!
//! let metrics = MetricsCollector::new(MetricsConfig::builder().namespace("products").build());
//! metrics.record_request("GetProducts", true, std::time::Duration::from_millis(42));
//!
//! let output = metrics.to_prometheus_text();
//! assert!(output.contains("products_requests_total"));
//! ```

use crate::runtime::circuit_breaker::{BreakerObserver, CircuitState};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Configuration for the metrics collector.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric namespace prefix (e.g., "products" -> "products_requests_total")
    pub namespace: String,
    /// Histogram buckets for call duration (in seconds)
    pub histogram_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "resilient_rpc".to_string(),
            histogram_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ],
        }
    }
}

impl MetricsConfig {
    /// Create a new builder for `MetricsConfig`.
    pub fn builder() -> MetricsConfigBuilder {
        MetricsConfigBuilder::default()
    }
}

/// Builder for `MetricsConfig`.
#[derive(Debug, Default)]
pub struct MetricsConfigBuilder {
    namespace: Option<String>,
    histogram_buckets: Option<Vec<f64>>,
}

impl MetricsConfigBuilder {
    /// Set the metric namespace prefix.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set histogram buckets (in seconds).
    pub fn histogram_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.histogram_buckets = Some(buckets);
        self
    }

    /// Build the `MetricsConfig`.
    pub fn build(self) -> MetricsConfig {
        let default = MetricsConfig::default();
        MetricsConfig {
            namespace: self.namespace.unwrap_or(default.namespace),
            histogram_buckets: self.histogram_buckets.unwrap_or(default.histogram_buckets),
        }
    }
}

/// Atomic values keyed by a label value, created on first use.
#[derive(Debug, Default)]
struct Family {
    values: RwLock<BTreeMap<String, AtomicU64>>,
}

impl Family {
    fn with<R>(&self, key: &str, f: impl FnOnce(&AtomicU64) -> R) -> R {
        {
            let values = self.values.read().expect("lock poisoned");
            if let Some(value) = values.get(key) {
                return f(value);
            }
        }
        let mut values = self.values.write().expect("lock poisoned");
        f(values.entry(key.to_string()).or_default())
    }

    fn increment(&self, key: &str) {
        self.with(key, |v| v.fetch_add(1, Ordering::Relaxed));
    }

    fn set(&self, key: &str, value: u64) {
        self.with(key, |v| v.store(value, Ordering::Relaxed));
    }

    fn get(&self, key: &str) -> u64 {
        self.values
            .read()
            .expect("lock poisoned")
            .get(key)
            .map_or(0, |v| v.load(Ordering::Relaxed))
    }

    fn sum(&self) -> u64 {
        self.values
            .read()
            .expect("lock poisoned")
            .values()
            .map(|v| v.load(Ordering::Relaxed))
            .sum()
    }

    fn render(&self, out: &mut String, name: &str, label: &str) {
        let values = self.values.read().expect("lock poisoned");
        for (key, value) in values.iter() {
            let _ = writeln!(
                out,
                "{name}{{{label}=\"{key}\"}} {}",
                value.load(Ordering::Relaxed)
            );
        }
    }
}

/// A single histogram with cumulative bucket counters.
#[derive(Debug)]
struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_nanos: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_nanos: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let secs = duration.as_secs_f64();
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            if secs <= *bucket {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.sum_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn sum_secs(&self) -> f64 {
        Duration::from_nanos(self.sum_nanos.load(Ordering::Relaxed)).as_secs_f64()
    }

    fn total_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Thread-safe metrics collector for the call pipeline.
#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    /// Counter: requests_total{operation, status}
    requests_total: RwLock<BTreeMap<(String, &'static str), AtomicU64>>,
    /// Histogram: request_duration_seconds{operation}
    request_duration: RwLock<BTreeMap<String, Histogram>>,
    /// Counter: retries_total{operation}
    retries: Family,
    /// Counter: rate_limited_total{operation}
    rate_limited: Family,
    /// Gauge: circuit_breaker_state{operation} (0=closed, 1=half-open, 2=open)
    circuit_breaker_state: Family,
    /// Counter: circuit_breaker_rejections_total
    circuit_breaker_rejections: AtomicU64,
    /// Gauge: live_endpoints{service}
    live_endpoints: Family,
    start_time: Instant,
}

impl MetricsCollector {
    /// Create a new metrics collector with the given configuration.
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            requests_total: RwLock::new(BTreeMap::new()),
            request_duration: RwLock::new(BTreeMap::new()),
            retries: Family::default(),
            rate_limited: Family::default(),
            circuit_breaker_state: Family::default(),
            circuit_breaker_rejections: AtomicU64::new(0),
            live_endpoints: Family::default(),
            start_time: Instant::now(),
        }
    }

    /// Create a new metrics collector with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(MetricsConfig::default())
    }

    /// Record a completed call.
    pub fn record_request(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };
        let key = (operation.to_string(), status);
        {
            let counters = self.requests_total.read().expect("lock poisoned");
            if let Some(counter) = counters.get(&key) {
                counter.fetch_add(1, Ordering::Relaxed);
            } else {
                drop(counters);
                self.requests_total
                    .write()
                    .expect("lock poisoned")
                    .entry(key)
                    .or_default()
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        let histograms = self.request_duration.read().expect("lock poisoned");
        if let Some(hist) = histograms.get(operation) {
            hist.observe(duration);
        } else {
            drop(histograms);
            self.request_duration
                .write()
                .expect("lock poisoned")
                .entry(operation.to_string())
                .or_insert_with(|| Histogram::new(self.config.histogram_buckets.clone()))
                .observe(duration);
        }
    }

    /// Record one retry of `operation`.
    pub fn record_retry(&self, operation: &str) {
        self.retries.increment(operation);
    }

    /// Record a call rejected by the rate limiter.
    pub fn record_rate_limited(&self, operation: &str) {
        self.rate_limited.increment(operation);
    }

    /// Record a call rejected by an open circuit.
    pub fn record_circuit_breaker_rejection(&self) {
        self.circuit_breaker_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Update the circuit breaker state gauge for `operation`.
    pub fn set_circuit_breaker_state(&self, operation: &str, state: CircuitState) {
        self.circuit_breaker_state
            .set(operation, state.as_gauge());
    }

    /// Current breaker state gauge for `operation` (0 when never reported).
    pub fn circuit_breaker_state(&self, operation: &str) -> u64 {
        self.circuit_breaker_state.get(operation)
    }

    /// Update the live endpoint gauge for `service`.
    pub fn set_live_endpoints(&self, service: &str, count: usize) {
        self.live_endpoints
            .set(service, u64::try_from(count).unwrap_or(u64::MAX));
    }

    /// Get the total number of calls.
    pub fn total_requests(&self) -> u64 {
        let counters = self.requests_total.read().expect("lock poisoned");
        counters.values().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    fn requests_with_status(&self, status: &str) -> u64 {
        let counters = self.requests_total.read().expect("lock poisoned");
        counters
            .iter()
            .filter(|((_, s), _)| *s == status)
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Get the number of successful calls.
    pub fn successful_requests(&self) -> u64 {
        self.requests_with_status("success")
    }

    /// Get the number of failed calls.
    pub fn failed_requests(&self) -> u64 {
        self.requests_with_status("error")
    }

    /// Get collector uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus_text(&self) -> String {
        let mut out = String::new();
        let ns = &self.config.namespace;

        let _ = writeln!(out, "# HELP {ns}_requests_total Total number of calls");
        let _ = writeln!(out, "# TYPE {ns}_requests_total counter");
        {
            let counters = self.requests_total.read().expect("lock poisoned");
            for ((operation, status), count) in counters.iter() {
                let _ = writeln!(
                    out,
                    "{ns}_requests_total{{operation=\"{operation}\",status=\"{status}\"}} {}",
                    count.load(Ordering::Relaxed)
                );
            }
        }
        out.push('\n');

        let _ = writeln!(
            out,
            "# HELP {ns}_request_duration_seconds Call duration in seconds"
        );
        let _ = writeln!(out, "# TYPE {ns}_request_duration_seconds histogram");
        {
            let histograms = self.request_duration.read().expect("lock poisoned");
            for (operation, hist) in histograms.iter() {
                for (bucket, count) in hist.buckets.iter().zip(&hist.counts) {
                    let _ = writeln!(
                        out,
                        "{ns}_request_duration_seconds_bucket{{operation=\"{operation}\",le=\"{bucket}\"}} {}",
                        count.load(Ordering::Relaxed)
                    );
                }
                let total = hist.total_count();
                let _ = writeln!(
                    out,
                    "{ns}_request_duration_seconds_bucket{{operation=\"{operation}\",le=\"+Inf\"}} {total}"
                );
                let _ = writeln!(
                    out,
                    "{ns}_request_duration_seconds_sum{{operation=\"{operation}\"}} {}",
                    hist.sum_secs()
                );
                let _ = writeln!(
                    out,
                    "{ns}_request_duration_seconds_count{{operation=\"{operation}\"}} {total}"
                );
            }
        }
        out.push('\n');

        let _ = writeln!(out, "# HELP {ns}_retries_total Retried attempts");
        let _ = writeln!(out, "# TYPE {ns}_retries_total counter");
        self.retries
            .render(&mut out, &format!("{ns}_retries_total"), "operation");
        out.push('\n');

        let _ = writeln!(
            out,
            "# HELP {ns}_rate_limited_total Calls rejected by the rate limiter"
        );
        let _ = writeln!(out, "# TYPE {ns}_rate_limited_total counter");
        self.rate_limited
            .render(&mut out, &format!("{ns}_rate_limited_total"), "operation");
        out.push('\n');

        let _ = writeln!(
            out,
            "# HELP {ns}_circuit_breaker_state Circuit breaker state (0=closed, 1=half-open, 2=open)"
        );
        let _ = writeln!(out, "# TYPE {ns}_circuit_breaker_state gauge");
        self.circuit_breaker_state.render(
            &mut out,
            &format!("{ns}_circuit_breaker_state"),
            "operation",
        );
        out.push('\n');

        let _ = writeln!(
            out,
            "# HELP {ns}_circuit_breaker_rejections_total Calls rejected by an open circuit"
        );
        let _ = writeln!(out, "# TYPE {ns}_circuit_breaker_rejections_total counter");
        let _ = writeln!(
            out,
            "{ns}_circuit_breaker_rejections_total {}\n",
            self.circuit_breaker_rejections.load(Ordering::Relaxed)
        );

        let _ = writeln!(out, "# HELP {ns}_live_endpoints Endpoints currently in rotation");
        let _ = writeln!(out, "# TYPE {ns}_live_endpoints gauge");
        self.live_endpoints
            .render(&mut out, &format!("{ns}_live_endpoints"), "service");
        out.push('\n');

        let _ = writeln!(out, "# HELP {ns}_uptime_seconds Collector uptime in seconds");
        let _ = writeln!(out, "# TYPE {ns}_uptime_seconds gauge");
        let _ = writeln!(out, "{ns}_uptime_seconds {}", self.uptime().as_secs_f64());

        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BreakerObserver for MetricsCollector {
    fn on_transition(&self, operation: &str, _from: CircuitState, to: CircuitState) {
        self.set_circuit_breaker_state(operation, to);
    }
}

/// Snapshot of current metrics for programmatic access.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total calls
    pub total_requests: u64,
    /// Successful calls
    pub successful_requests: u64,
    /// Failed calls
    pub failed_requests: u64,
    /// Retried attempts across all operations
    pub retries: u64,
    /// Rate limiter rejections across all operations
    pub rate_limited: u64,
    /// Circuit breaker rejection count
    pub circuit_breaker_rejections: u64,
    /// Live endpoints across all services
    pub live_endpoints: u64,
    /// Collector uptime
    pub uptime: Duration,
}

impl MetricsCollector {
    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests(),
            successful_requests: self.successful_requests(),
            failed_requests: self.failed_requests(),
            retries: self.retries.sum(),
            rate_limited: self.rate_limited.sum(),
            circuit_breaker_rejections: self.circuit_breaker_rejections.load(Ordering::Relaxed),
            live_endpoints: self.live_endpoints.sum(),
            uptime: self.uptime(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_builder() {
        let config = MetricsConfig::builder()
            .namespace("products")
            .histogram_buckets(vec![0.1, 0.5, 1.0])
            .build();

        assert_eq!(config.namespace, "products");
        assert_eq!(config.histogram_buckets, vec![0.1, 0.5, 1.0]);
        assert_eq!(MetricsConfig::default().namespace, "resilient_rpc");
    }

    #[test]
    fn test_record_requests() {
        let metrics = MetricsCollector::with_defaults();
        metrics.record_request("GetProducts", true, Duration::from_millis(10));
        metrics.record_request("GetProducts", true, Duration::from_millis(20));
        metrics.record_request("GetProduct", false, Duration::from_millis(30));

        assert_eq!(metrics.total_requests(), 3);
        assert_eq!(metrics.successful_requests(), 2);
        assert_eq!(metrics.failed_requests(), 1);
    }

    #[test]
    fn test_breaker_observer_sets_gauge() {
        let metrics = MetricsCollector::with_defaults();
        metrics.on_transition("GetProducts", CircuitState::Closed, CircuitState::Open);
        assert_eq!(metrics.circuit_breaker_state("GetProducts"), 2);

        metrics.on_transition("GetProducts", CircuitState::Open, CircuitState::HalfOpen);
        assert_eq!(metrics.circuit_breaker_state("GetProducts"), 1);
        assert_eq!(metrics.circuit_breaker_state("Unknown"), 0);
    }

    #[test]
    fn test_snapshot() {
        let metrics = MetricsCollector::with_defaults();
        metrics.record_request("GetProducts", true, Duration::from_millis(10));
        metrics.record_retry("GetProducts");
        metrics.record_rate_limited("GetProducts");
        metrics.record_circuit_breaker_rejection();
        metrics.set_live_endpoints("products", 3);
        metrics.set_live_endpoints("products", 2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.circuit_breaker_rejections, 1);
        assert_eq!(snapshot.live_endpoints, 2);
    }

    #[test]
    fn test_prometheus_text_format() {
        let metrics = MetricsCollector::new(MetricsConfig {
            namespace: "test".to_string(),
            histogram_buckets: vec![0.1, 1.0],
        });

        metrics.record_request("GetProducts", true, Duration::from_millis(50));
        metrics.set_live_endpoints("products", 2);
        metrics.set_circuit_breaker_state("GetProducts", CircuitState::Open);

        let output = metrics.to_prometheus_text();

        assert!(output.contains("# TYPE test_requests_total counter"));
        assert!(output
            .contains("test_requests_total{operation=\"GetProducts\",status=\"success\"} 1"));
        assert!(output.contains(
            "test_request_duration_seconds_bucket{operation=\"GetProducts\",le=\"0.1\"} 1"
        ));
        assert!(output
            .contains("test_request_duration_seconds_count{operation=\"GetProducts\"} 1"));
        assert!(output.contains("test_circuit_breaker_state{operation=\"GetProducts\"} 2"));
        assert!(output.contains("test_live_endpoints{service=\"products\"} 2"));
        assert!(output.contains("test_uptime_seconds"));
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = Histogram::new(vec![0.01, 0.1, 1.0]);
        hist.observe(Duration::from_millis(50));

        assert_eq!(hist.counts[0].load(Ordering::Relaxed), 0);
        assert_eq!(hist.counts[1].load(Ordering::Relaxed), 1);
        assert_eq!(hist.counts[2].load(Ordering::Relaxed), 1);
        assert_eq!(hist.total_count(), 1);
        assert!((hist.sum_secs() - 0.05).abs() < 1e-9);
    }
}
