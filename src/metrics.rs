//! Prometheus metrics.
//!
//! Recording goes through the `metrics` facade, so calls are no-ops until
//! [`init`] installs the recorder.

use ::metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global recorder once and return its render handle.
pub fn init() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            // A recorder may already be installed (e.g. by a test harness)
            let _ = ::metrics::set_global_recorder(recorder);
            handle
        })
        .clone()
}

pub fn record_request(endpoint: &'static str, status: u16) {
    counter!(
        "embedgate_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_duration(endpoint: &'static str, start: Instant) {
    histogram!("embedgate_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_stage_failure(stage: &'static str) {
    counter!("embedgate_stage_failures_total", "stage" => stage).increment(1);
}

pub fn record_restart() {
    counter!("embedgate_pipeline_restarts_total").increment(1);
}

pub fn record_token_cache(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!("embedgate_token_cache_total", "outcome" => outcome).increment(1);
}

pub fn record_rule(rule: &str, matched: bool) {
    let outcome = if matched { "hit" } else { "miss" };
    counter!(
        "embedgate_extraction_rule_total",
        "rule" => rule.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_upstream_error(kind: &'static str) {
    counter!("embedgate_upstream_errors_total", "kind" => kind).increment(1);
}
