//! Observability infrastructure for the detection service
//!
//! Provides:
//! - Prometheus metrics (cycle and stage latency, outcomes, verdict counts)
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for cycle and stage durations (in seconds)
///
/// A cycle is dominated by the capture window and the extractor run, so the
/// buckets reach well past the default extractor timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance, `None` if registration failed
static GLOBAL_METRICS: OnceLock<Option<SentinelMetricsInner>> = OnceLock::new();

struct SentinelMetricsInner {
    cycle_duration_seconds: Histogram,
    stage_duration_seconds: HistogramVec,
    cycles_total: IntCounterVec,
    stage_errors_total: IntCounterVec,
    flows_aligned: IntGauge,
    predictions_total: IntCounterVec,
    classifier_failures_total: IntCounterVec,
    slow_inferences_total: IntCounterVec,
    classifiers_loaded: IntGauge,
}

impl SentinelMetricsInner {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            cycle_duration_seconds: register_histogram!(
                "flow_sentinel_cycle_duration_seconds",
                "Wall time of one detection cycle",
                DURATION_BUCKETS.to_vec()
            )?,

            stage_duration_seconds: register_histogram_vec!(
                "flow_sentinel_stage_duration_seconds",
                "Wall time spent in each cycle stage",
                &["stage"],
                DURATION_BUCKETS.to_vec()
            )?,

            cycles_total: register_int_counter_vec!(
                "flow_sentinel_cycles_total",
                "Detection cycles by outcome",
                &["outcome"]
            )?,

            stage_errors_total: register_int_counter_vec!(
                "flow_sentinel_stage_errors_total",
                "Cycle aborts by failing stage",
                &["stage"]
            )?,

            flows_aligned: register_int_gauge!(
                "flow_sentinel_flows_aligned",
                "Flows aligned in the most recent cycle"
            )?,

            predictions_total: register_int_counter_vec!(
                "flow_sentinel_predictions_total",
                "Emitted verdicts by label",
                &["label"]
            )?,

            classifier_failures_total: register_int_counter_vec!(
                "flow_sentinel_classifier_failures_total",
                "Classifier scoring failures by model",
                &["model"]
            )?,

            slow_inferences_total: register_int_counter_vec!(
                "flow_sentinel_slow_inferences_total",
                "Single-row inferences slower than the latency target, by model",
                &["model"]
            )?,

            classifiers_loaded: register_int_gauge!(
                "flow_sentinel_classifiers_loaded",
                "Number of classifiers in the loaded artifact set"
            )?,
        })
    }
}

/// Sentinel metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct SentinelMetrics {
    _private: (),
}

impl Default for SentinelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SentinelMetrics {
    /// Create a new metrics handle (registers global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(|| match SentinelMetricsInner::register() {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!(error = %e, "Failed to register metrics, continuing without them");
                None
            }
        });
        Self { _private: () }
    }

    fn with(&self, f: impl FnOnce(&SentinelMetricsInner)) {
        if let Some(Some(inner)) = GLOBAL_METRICS.get() {
            f(inner);
        }
    }

    pub fn observe_cycle_duration(&self, elapsed: Duration) {
        self.with(|m| m.cycle_duration_seconds.observe(elapsed.as_secs_f64()));
    }

    pub fn observe_stage_duration(&self, stage: &str, elapsed: Duration) {
        self.with(|m| {
            m.stage_duration_seconds
                .with_label_values(&[stage])
                .observe(elapsed.as_secs_f64())
        });
    }

    /// Count a finished cycle, `outcome` is "emitted" or "aborted"
    pub fn inc_cycles(&self, outcome: &str) {
        self.with(|m| m.cycles_total.with_label_values(&[outcome]).inc());
    }

    pub fn inc_stage_error(&self, stage: &str) {
        self.with(|m| m.stage_errors_total.with_label_values(&[stage]).inc());
    }

    pub fn set_flows_aligned(&self, count: usize) {
        self.with(|m| m.flows_aligned.set(count as i64));
    }

    pub fn inc_prediction(&self, label: &str) {
        self.with(|m| m.predictions_total.with_label_values(&[label]).inc());
    }

    pub fn inc_classifier_failure(&self, model: &str) {
        self.with(|m| {
            m.classifier_failures_total
                .with_label_values(&[model])
                .inc()
        });
    }

    pub fn inc_slow_inference(&self, model: &str) {
        self.with(|m| m.slow_inferences_total.with_label_values(&[model]).inc());
    }

    pub fn set_classifiers_loaded(&self, count: usize) {
        self.with(|m| m.classifiers_loaded.set(count as i64));
    }

    /// Render every registered metric in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Structured logger for sentinel lifecycle events
///
/// Every event carries the sensor name so logs from several hosts can be
/// told apart once aggregated.
#[derive(Clone)]
pub struct StructuredLogger {
    sensor: String,
}

impl StructuredLogger {
    pub fn new(sensor: impl Into<String>) -> Self {
        Self {
            sensor: sensor.into(),
        }
    }

    /// Log service startup
    pub fn log_startup(&self, version: &str, interface: &str, classifiers: &[&str]) {
        info!(
            event = "sentinel_started",
            sensor = %self.sensor,
            version = %version,
            interface = %interface,
            classifiers = ?classifiers,
            "Flow sentinel started"
        );
    }

    /// Log a cycle that emitted a batch
    pub fn log_cycle_completed(
        &self,
        cycle: u64,
        packets: u64,
        flows: usize,
        predictions: usize,
        elapsed: Duration,
    ) {
        info!(
            event = "cycle_completed",
            sensor = %self.sensor,
            cycle = cycle,
            packets = packets,
            flows = flows,
            predictions = predictions,
            elapsed_ms = elapsed.as_millis() as u64,
            "Detection cycle completed"
        );
    }

    /// Log a cycle abandoned at `stage`
    pub fn log_cycle_aborted(&self, cycle: u64, stage: &str, reason: &str) {
        warn!(
            event = "cycle_aborted",
            sensor = %self.sensor,
            cycle = cycle,
            stage = %stage,
            reason = %reason,
            "Detection cycle aborted"
        );
    }

    /// Log service shutdown
    pub fn log_shutdown(&self, reason: &str, cycles: u64) {
        info!(
            event = "sentinel_shutdown",
            sensor = %self.sensor,
            reason = %reason,
            cycles = cycles,
            "Flow sentinel shutting down"
        );
    }
}
