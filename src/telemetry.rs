//! Prometheus metrics for flow, step, cache, and fallback behavior.

use once_cell::sync::Lazy;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

pub static FLOW_EXECUTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bff_flow_executions_total",
        "Total flow executions by flow name and outcome",
        &["flow", "outcome"]
    )
    .expect("registering bff_flow_executions_total")
});

pub static FLOW_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "bff_flow_duration_seconds",
        "Flow execution duration in seconds",
        &["flow"]
    )
    .expect("registering bff_flow_duration_seconds")
});

pub static STEP_EXECUTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bff_step_executions_total",
        "Total step executions by step name and outcome",
        &["step", "outcome"]
    )
    .expect("registering bff_step_executions_total")
});

pub static STEP_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "bff_step_duration_seconds",
        "Step execution duration in seconds",
        &["step"]
    )
    .expect("registering bff_step_duration_seconds")
});

pub static CACHE_OPERATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bff_cache_operations_total",
        "Cache operations by kind and outcome (hit/miss/set/delete)",
        &["operation", "outcome"]
    )
    .expect("registering bff_cache_operations_total")
});

pub static FALLBACK_USED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bff_fallback_used_total",
        "Count of times a step's fallback data was used after terminal failure",
        &["step"]
    )
    .expect("registering bff_fallback_used_total")
});

pub fn record_flow_execution(flow: &str, success: bool, duration_secs: f64) {
    let outcome = if success { "success" } else { "failure" };
    FLOW_EXECUTIONS_TOTAL.with_label_values(&[flow, outcome]).inc();
    FLOW_DURATION_SECONDS.with_label_values(&[flow]).observe(duration_secs);
}

pub fn record_step_execution(step: &str, success: bool, duration_secs: f64) {
    let outcome = if success { "success" } else { "failure" };
    STEP_EXECUTIONS_TOTAL.with_label_values(&[step, outcome]).inc();
    STEP_DURATION_SECONDS.with_label_values(&[step]).observe(duration_secs);
}

pub fn record_cache_operation(operation: &str, outcome: &str) {
    CACHE_OPERATIONS_TOTAL.with_label_values(&[operation, outcome]).inc();
}

pub fn record_fallback_used(step: &str) {
    FALLBACK_USED_TOTAL.with_label_values(&[step]).inc();
}

/// Render the process's metrics in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    encoder.encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
