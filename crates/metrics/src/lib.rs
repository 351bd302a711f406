//! Metrics and tracing setup for ringkv.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate. The HTTP layer exposes [`encode_metrics`] on `GET /metrics`.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a ringkv node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Replica traffic ──
    pub replica_requests_sent: IntCounterVec,
    pub replica_requests_received: IntCounterVec,
    pub replica_failures: IntCounterVec,
    pub replica_latency_secs: HistogramVec,

    // ── Client operations ──
    pub kv_puts: IntCounter,
    pub kv_gets: IntCounter,
    pub kv_deletes: IntCounter,
    pub kv_latency_secs: HistogramVec,
    pub quorum_failures: IntCounterVec,

    // ── Read repair ──
    pub read_repairs: IntCounter,

    // ── Local storage ──
    pub storage_flushes: IntCounter,
    pub storage_compactions: IntCounter,
    pub storage_latency_secs: HistogramVec,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for replica/KV latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

/// Buckets for flush and compaction, which run much longer than requests.
const STORAGE_BUCKETS: &[f64] = &[0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts")
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec opts")
}

fn histogram_vec(name: &str, help: &str, buckets: &[f64], labels: &[&str]) -> HistogramVec {
    HistogramVec::new(
        HistogramOpts::new(name, help).buckets(buckets.to_vec()),
        labels,
    )
    .expect("valid histogram opts")
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let replica_requests_sent = counter_vec(
            "ringkv_replica_requests_sent_total",
            "Replica requests sent to peers, by operation",
            &["op"],
        );
        let replica_requests_received = counter_vec(
            "ringkv_replica_requests_received_total",
            "Replica requests received from coordinators, by operation",
            &["op"],
        );
        let replica_failures = counter_vec(
            "ringkv_replica_failures_total",
            "Failed replica calls, by operation and reason",
            &["op", "reason"],
        );
        let replica_latency_secs = histogram_vec(
            "ringkv_replica_latency_seconds",
            "Replica call latency in seconds",
            LATENCY_BUCKETS,
            &["op", "direction"],
        );

        let kv_puts = counter("ringkv_kv_puts_total", "KV PUT operations");
        let kv_gets = counter("ringkv_kv_gets_total", "KV GET operations");
        let kv_deletes = counter("ringkv_kv_deletes_total", "KV DELETE operations");
        let kv_latency_secs = histogram_vec(
            "ringkv_kv_latency_seconds",
            "KV operation latency in seconds",
            LATENCY_BUCKETS,
            &["op_type"],
        );
        let quorum_failures = counter_vec(
            "ringkv_quorum_failures_total",
            "Operations that did not reach their quorum",
            &["op_type"],
        );

        let read_repairs = counter(
            "ringkv_read_repairs_total",
            "Read repair writes issued to stale replicas",
        );

        let storage_flushes = counter(
            "ringkv_storage_flushes_total",
            "Memtable flushes to immutable segments",
        );
        let storage_compactions = counter(
            "ringkv_storage_compactions_total",
            "Completed segment compactions",
        );
        let storage_latency_secs = histogram_vec(
            "ringkv_storage_latency_seconds",
            "Flush and compaction duration in seconds",
            STORAGE_BUCKETS,
            &["op"],
        );

        // Register all metrics
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(replica_requests_sent.clone()),
            Box::new(replica_requests_received.clone()),
            Box::new(replica_failures.clone()),
            Box::new(replica_latency_secs.clone()),
            Box::new(kv_puts.clone()),
            Box::new(kv_gets.clone()),
            Box::new(kv_deletes.clone()),
            Box::new(kv_latency_secs.clone()),
            Box::new(quorum_failures.clone()),
            Box::new(read_repairs.clone()),
            Box::new(storage_flushes.clone()),
            Box::new(storage_compactions.clone()),
            Box::new(storage_latency_secs.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("metric names are unique");
        }

        Self {
            registry,
            replica_requests_sent,
            replica_requests_received,
            replica_failures,
            replica_latency_secs,
            kv_puts,
            kv_gets,
            kv_deletes,
            kv_latency_secs,
            quorum_failures,
            read_repairs,
            storage_flushes,
            storage_compactions,
            storage_latency_secs,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start a replica call latency timer. Returns a guard that records
/// elapsed time on drop.
pub fn start_replica_timer(op: &str, direction: &str) -> prometheus::HistogramTimer {
    metrics()
        .replica_latency_secs
        .with_label_values(&[op, direction])
        .start_timer()
}

/// Helper: start a KV operation latency timer.
pub fn start_kv_timer(op_type: &str) -> prometheus::HistogramTimer {
    metrics()
        .kv_latency_secs
        .with_label_values(&[op_type])
        .start_timer()
}

/// Helper: start a flush or compaction timer.
pub fn start_storage_timer(op: &str) -> prometheus::HistogramTimer {
    metrics()
        .storage_latency_secs
        .with_label_values(&[op])
        .start_timer()
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Histogram;

    #[test]
    fn test_metrics_init_and_increment() {
        let m = metrics();

        let sent = m.replica_requests_sent.with_label_values(&["put"]);
        let before = sent.get();
        sent.inc();
        sent.inc();
        assert_eq!(sent.get(), before + 2);

        let before_puts = m.kv_puts.get();
        m.kv_puts.inc();
        assert_eq!(m.kv_puts.get(), before_puts + 1);

        m.kv_gets.inc();
        m.kv_deletes.inc();
        m.replica_failures
            .with_label_values(&["get", "timeout"])
            .inc();
    }

    #[test]
    fn test_encode_metrics_format() {
        metrics().read_repairs.inc();
        metrics()
            .quorum_failures
            .with_label_values(&["put"])
            .inc();

        let output = encode_metrics();
        assert!(output.contains("ringkv_read_repairs_total"));
        assert!(output.contains("ringkv_quorum_failures_total"));
        assert!(output.contains("ringkv_kv_puts_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_histogram_records() {
        let m = metrics();

        m.replica_latency_secs
            .with_label_values(&["test_op", "outbound"])
            .observe(0.005);
        m.replica_latency_secs
            .with_label_values(&["test_op", "outbound"])
            .observe(0.010);

        let h: Histogram = m
            .replica_latency_secs
            .with_label_values(&["test_op", "outbound"]);
        assert_eq!(h.get_sample_count(), 2);
        assert!((h.get_sample_sum() - 0.015).abs() < 1e-9);
    }

    #[test]
    fn test_storage_timer_observes_on_drop() {
        let h = metrics().storage_latency_secs.with_label_values(&["test_flush"]);
        let before = h.get_sample_count();
        {
            let _timer = start_storage_timer("test_flush");
        }
        assert_eq!(h.get_sample_count(), before + 1);
    }
}
