//! Self-metrics for the aggregation pipeline
//!
//! Prometheus metrics exposed on the daemon's `/metrics` endpoint. The
//! underlying collectors live in a process-global registry initialised
//! once; [`PipelineMetrics`] is a cheap cloneable handle.

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;

/// Histogram buckets for scrape/tick latencies (in seconds). Ticks are
/// bounded by the 20 s scrape deadline plus processing.
const LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0,
];

static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    scrape_latency_seconds: Histogram,
    tick_latency_seconds: Histogram,
    ticks_skipped_total: IntCounter,
    scrape_errors_total: IntCounter,
    scrape_timeouts_total: IntCounter,
    duplicate_keys_total: IntCounter,
    invariant_breaches_total: IntCounter,
    sink_exports_total: IntCounterVec,
    sink_export_failures_total: IntCounterVec,
    sink_batches_dropped_total: IntCounterVec,
    last_batch_metric_sets: IntGauge,
    sources_scraped: IntGauge,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            scrape_latency_seconds: register_histogram!(
                "metrics_aggregator_scrape_latency_seconds",
                "Time spent scraping all sources for one tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register scrape_latency_seconds"),

            tick_latency_seconds: register_histogram!(
                "metrics_aggregator_tick_latency_seconds",
                "End-to-end time of one pipeline tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            ticks_skipped_total: register_int_counter!(
                "metrics_aggregator_ticks_skipped_total",
                "Tick boundaries skipped because the previous tick was still executing"
            )
            .expect("Failed to register ticks_skipped_total"),

            scrape_errors_total: register_int_counter!(
                "metrics_aggregator_scrape_errors_total",
                "Source scrapes that failed"
            )
            .expect("Failed to register scrape_errors_total"),

            scrape_timeouts_total: register_int_counter!(
                "metrics_aggregator_scrape_timeouts_total",
                "Source scrapes that exceeded the scrape deadline"
            )
            .expect("Failed to register scrape_timeouts_total"),

            duplicate_keys_total: register_int_counter!(
                "metrics_aggregator_duplicate_keys_total",
                "Metric set keys returned by more than one source in a tick"
            )
            .expect("Failed to register duplicate_keys_total"),

            invariant_breaches_total: register_int_counter!(
                "metrics_aggregator_invariant_breaches_total",
                "Metric sets dropped from a batch for violating a pipeline invariant"
            )
            .expect("Failed to register invariant_breaches_total"),

            sink_exports_total: register_int_counter_vec!(
                "metrics_aggregator_sink_exports_total",
                "Batches exported per sink",
                &["sink"]
            )
            .expect("Failed to register sink_exports_total"),

            sink_export_failures_total: register_int_counter_vec!(
                "metrics_aggregator_sink_export_failures_total",
                "Exports abandoned after exceeding the export deadline",
                &["sink"]
            )
            .expect("Failed to register sink_export_failures_total"),

            sink_batches_dropped_total: register_int_counter_vec!(
                "metrics_aggregator_sink_batches_dropped_total",
                "Batches discarded because a sink's mailbox was still full",
                &["sink"]
            )
            .expect("Failed to register sink_batches_dropped_total"),

            last_batch_metric_sets: register_int_gauge!(
                "metrics_aggregator_last_batch_metric_sets",
                "Number of metric sets in the most recently exported batch"
            )
            .expect("Failed to register last_batch_metric_sets"),

            sources_scraped: register_int_gauge!(
                "metrics_aggregator_sources_scraped",
                "Number of sources scraped in the last tick"
            )
            .expect("Failed to register sources_scraped"),
        }
    }
}

/// Handle to the process-global pipeline metrics. Clones share the same
/// underlying collectors.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_scrape_latency(&self, seconds: f64) {
        self.inner().scrape_latency_seconds.observe(seconds);
    }

    pub fn observe_tick_latency(&self, seconds: f64) {
        self.inner().tick_latency_seconds.observe(seconds);
    }

    pub fn inc_ticks_skipped(&self) {
        self.inner().ticks_skipped_total.inc();
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.inner().ticks_skipped_total.get()
    }

    pub fn inc_scrape_errors(&self) {
        self.inner().scrape_errors_total.inc();
    }

    pub fn inc_scrape_timeouts(&self) {
        self.inner().scrape_timeouts_total.inc();
    }

    pub fn inc_duplicate_keys(&self) {
        self.inner().duplicate_keys_total.inc();
    }

    pub fn inc_invariant_breaches(&self) {
        self.inner().invariant_breaches_total.inc();
    }

    pub fn inc_sink_exports(&self, sink: &str) {
        self.inner().sink_exports_total.with_label_values(&[sink]).inc();
    }

    pub fn inc_sink_export_failures(&self, sink: &str) {
        self.inner()
            .sink_export_failures_total
            .with_label_values(&[sink])
            .inc();
    }

    pub fn inc_sink_batches_dropped(&self, sink: &str) {
        self.inner()
            .sink_batches_dropped_total
            .with_label_values(&[sink])
            .inc();
    }

    pub fn sink_batches_dropped(&self, sink: &str) -> u64 {
        self.inner()
            .sink_batches_dropped_total
            .with_label_values(&[sink])
            .get()
    }

    pub fn set_last_batch_metric_sets(&self, count: i64) {
        self.inner().last_batch_metric_sets.set(count);
    }

    pub fn set_sources_scraped(&self, count: i64) {
        self.inner().sources_scraped.set(count);
    }
}
