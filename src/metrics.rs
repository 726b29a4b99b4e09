//! Metric registry and Prometheus text exposition.
//!
//! Counters, gauges, and histograms keyed by name + label set, backed by
//! atomics in `DashMap`s so the hot path never takes a lock beyond the
//! shard guard. `render` produces the Prometheus text format served at
//! `/api/metrics`.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;

/// Histogram bucket upper bounds in seconds (request latency oriented).
const BUCKETS: [f64; 10] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

type Labels = Vec<(&'static str, String)>;

/// A single histogram series: bucket counts, total count, sum in micros.
struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn observe(&self, seconds: f64) {
        for (i, le) in BUCKETS.iter().enumerate() {
            if seconds <= *le {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0).max(0.0) as u64, Ordering::Relaxed);
    }
}

/// Metric registry shared across the gateway.
#[derive(Default)]
pub struct Metrics {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    histograms: DashMap<String, Histogram>,
}

impl Metrics {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by 1.
    pub fn incr(&self, name: &str, labels: &Labels) {
        self.add(name, labels, 1);
    }

    /// Increment a counter by `n`.
    pub fn add(&self, name: &str, labels: &Labels, n: u64) {
        let key = series_key(name, labels);
        self.counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Set a gauge to `value`.
    pub fn set_gauge(&self, name: &str, labels: &Labels, value: i64) {
        let key = series_key(name, labels);
        self.gauges
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Adjust a gauge by `delta` (may be negative).
    pub fn add_gauge(&self, name: &str, labels: &Labels, delta: i64) {
        let key = series_key(name, labels);
        self.gauges
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Record a duration observation in seconds.
    pub fn observe(&self, name: &str, labels: &Labels, seconds: f64) {
        let key = series_key(name, labels);
        self.histograms
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(seconds);
    }

    /// Current value of a counter series (0 if never written).
    #[must_use]
    pub fn counter_value(&self, name: &str, labels: &Labels) -> u64 {
        self.counters
            .get(&series_key(name, labels))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Current value of a gauge series (0 if never written).
    #[must_use]
    pub fn gauge_value(&self, name: &str, labels: &Labels) -> i64 {
        self.gauges
            .get(&series_key(name, labels))
            .map_or(0, |g| g.load(Ordering::Relaxed))
    }

    /// Render the registry in Prometheus text exposition format.
    ///
    /// Series are sorted for deterministic output.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();

        let mut counters: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        counters.sort();
        for (key, value) in counters {
            let _ = writeln!(out, "{key} {value}");
        }

        let mut gauges: Vec<(String, i64)> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        gauges.sort();
        for (key, value) in gauges {
            let _ = writeln!(out, "{key} {value}");
        }

        let mut histogram_keys: Vec<String> =
            self.histograms.iter().map(|e| e.key().clone()).collect();
        histogram_keys.sort();
        for key in histogram_keys {
            if let Some(hist) = self.histograms.get(&key) {
                let (name, labels) = split_series_key(&key);
                for (i, le) in BUCKETS.iter().enumerate() {
                    let count = hist.buckets[i].load(Ordering::Relaxed);
                    let _ = writeln!(
                        out,
                        "{name}_bucket{} {count}",
                        merge_label(&labels, "le", &format_le(*le))
                    );
                }
                let count = hist.count.load(Ordering::Relaxed);
                let _ = writeln!(
                    out,
                    "{name}_bucket{} {count}",
                    merge_label(&labels, "le", "+Inf")
                );
                #[allow(clippy::cast_precision_loss)]
                let sum = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
                let _ = writeln!(out, "{name}_sum{labels} {sum}");
                let _ = writeln!(out, "{name}_count{labels} {count}");
            }
        }

        out
    }
}

/// Build the `name{k="v",...}` series key.
fn series_key(name: &str, labels: &Labels) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
        .collect();
    format!("{name}{{{}}}", rendered.join(","))
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Split a series key back into `(name, "{labels}")` for histogram suffixes.
fn split_series_key(key: &str) -> (&str, String) {
    match key.find('{') {
        Some(idx) => (&key[..idx], key[idx..].to_string()),
        None => (key, String::new()),
    }
}

/// Insert an extra label into a rendered `{...}` block (or create one).
fn merge_label(labels: &str, key: &str, value: &str) -> String {
    if labels.is_empty() {
        format!("{{{key}=\"{value}\"}}")
    } else {
        let inner = &labels[1..labels.len() - 1];
        format!("{{{inner},{key}=\"{value}\"}}")
    }
}

fn format_le(le: f64) -> String {
    // Display trims trailing zeros: 0.5 renders as "0.5", 1.0 as "1".
    format!("{le}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_accumulate() {
        let metrics = Metrics::new();
        let labels = vec![("method", "GET".to_string())];
        metrics.incr("keyfront_requests_total", &labels);
        metrics.incr("keyfront_requests_total", &labels);
        metrics.add("keyfront_requests_total", &labels, 3);
        assert_eq!(metrics.counter_value("keyfront_requests_total", &labels), 5);
    }

    #[test]
    fn distinct_labels_are_distinct_series() {
        let metrics = Metrics::new();
        let get = vec![("method", "GET".to_string())];
        let post = vec![("method", "POST".to_string())];
        metrics.incr("keyfront_requests_total", &get);
        assert_eq!(metrics.counter_value("keyfront_requests_total", &get), 1);
        assert_eq!(metrics.counter_value("keyfront_requests_total", &post), 0);
    }

    #[test]
    fn gauge_set_and_adjust() {
        let metrics = Metrics::new();
        let labels = vec![];
        metrics.set_gauge("keyfront_ws_connections", &labels, 3);
        metrics.add_gauge("keyfront_ws_connections", &labels, 2);
        metrics.add_gauge("keyfront_ws_connections", &labels, -1);
        assert_eq!(metrics.gauge_value("keyfront_ws_connections", &labels), 4);
    }

    #[test]
    fn render_emits_counter_series() {
        let metrics = Metrics::new();
        metrics.incr(
            "keyfront_requests_total",
            &vec![("method", "GET".to_string()), ("status", "200".to_string())],
        );
        let text = metrics.render();
        assert!(
            text.contains("keyfront_requests_total{method=\"GET\",status=\"200\"} 1"),
            "unexpected exposition: {text}"
        );
    }

    #[test]
    fn render_emits_histogram_buckets_and_sum() {
        let metrics = Metrics::new();
        let labels = vec![("path", "/api/me".to_string())];
        metrics.observe("keyfront_request_duration_seconds", &labels, 0.02);
        let text = metrics.render();
        assert!(text.contains("keyfront_request_duration_seconds_bucket{path=\"/api/me\",le=\"0.025\"} 1"));
        assert!(text.contains("keyfront_request_duration_seconds_bucket{path=\"/api/me\",le=\"+Inf\"} 1"));
        assert!(text.contains("keyfront_request_duration_seconds_count{path=\"/api/me\"} 1"));
        // 0.01 bucket must not contain the 0.02 observation.
        assert!(text.contains("keyfront_request_duration_seconds_bucket{path=\"/api/me\",le=\"0.01\"} 0"));
    }

    #[test]
    fn label_values_are_escaped() {
        let metrics = Metrics::new();
        metrics.incr(
            "keyfront_test_total",
            &vec![("value", "say \"hi\"".to_string())],
        );
        let text = metrics.render();
        assert!(text.contains(r#"value="say \"hi\"""#), "got: {text}");
    }

    #[test]
    fn unlabelled_series_render_bare() {
        let metrics = Metrics::new();
        metrics.incr("keyfront_audit_flushes_total", &vec![]);
        assert!(metrics.render().contains("keyfront_audit_flushes_total 1"));
    }
}
