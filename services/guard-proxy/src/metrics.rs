//! Prometheus metrics exposition
//!
//! Gateway metrics, rendered alongside the guard's own `session_guard_*`
//! counters on `/metrics`:
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_guard_errors_total` (counter): label `error_type`
//! - `client_events_total` (counter): label `event`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets from 5ms to 60s, the proxy's configurable timeout range.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Builder with `proxy_request_duration_seconds` rendered as a histogram
/// (`_bucket` lines) instead of the default summary.
pub fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("proxy_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record a guard or upstream failure by kind.
pub fn record_guard_error(error_type: &str) {
    metrics::counter!("proxy_guard_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Count an event reported by a client on `POST /api/metrics`.
pub fn record_client_event(event: &str) {
    metrics::counter!("client_events_total", "event" => event.to_string()).increment(1);
}
