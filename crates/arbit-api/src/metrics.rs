//! Metrics instrumentation for the arbit API.
//!
//! Exposes the inference pipeline's counters and latency histograms via
//! Prometheus text exposition on `/metrics`:
//!
//! - `inference_requests_total{status, provider, model}`
//! - `inference_queue_wait_seconds{provider, model}`
//! - `inference_exec_seconds{provider, model}`
//! - `inference_total_seconds{provider, model}`
//! - `rate_limit_hits_total{endpoint}`

use std::sync::OnceLock;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Inference request counter.
pub const INFER_REQUESTS: &str = "inference_requests_total";

/// Time a request spent waiting in the dispatcher queue.
pub const QUEUE_WAIT: &str = "inference_queue_wait_seconds";

/// Time spent executing the provider call.
pub const EXEC_TIME: &str = "inference_exec_seconds";

/// Total end-to-end time (queue wait + exec).
pub const TOTAL_TIME: &str = "inference_total_seconds";

/// Requests rejected by rate limiting.
pub const RATE_LIMIT_HITS: &str = "rate_limit_hits_total";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder and registers descriptions.
///
/// Safe to call multiple times; subsequent calls are no-ops. Registration
/// happens once per process regardless of deployment shape.
///
/// # Panics
///
/// Panics if the recorder cannot be installed; the service must not start
/// without its metrics.
#[allow(clippy::panic)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|e| panic!("failed to install prometheus recorder: {e}"));

            describe_counter!(INFER_REQUESTS, "Total number of /api/infer requests");
            describe_histogram!(
                QUEUE_WAIT,
                "Time a request spent waiting in the dispatcher queue"
            );
            describe_histogram!(EXEC_TIME, "Time spent executing the provider call");
            describe_histogram!(TOTAL_TIME, "Total end-to-end time (queue wait + exec)");
            describe_counter!(
                RATE_LIMIT_HITS,
                "Total number of requests rejected by rate limiting"
            );

            tracing::info!("prometheus metrics recorder initialized");
            handle
        })
        .clone()
}

/// Returns the global Prometheus handle, if initialized.
#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Records one observation on the infer request counter.
///
/// Every branch of the infer endpoint records exactly one observation;
/// empty provider/model labels collapse to `unknown` to keep cardinality
/// bounded and label sets total.
pub fn record_infer_request(status: StatusCode, provider: &str, model: &str) {
    let labels = [
        ("status", status.as_u16().to_string()),
        ("provider", non_empty(provider)),
        ("model", non_empty(model)),
    ];
    counter!(INFER_REQUESTS, &labels).increment(1);
}

/// Records the latency histograms for one successful inference.
pub fn record_infer_timings(
    provider: &str,
    model: &str,
    queue_wait: Duration,
    exec_time: Duration,
) {
    let labels = [
        ("provider", non_empty(provider)),
        ("model", non_empty(model)),
    ];
    histogram!(QUEUE_WAIT, &labels).record(queue_wait.as_secs_f64());
    histogram!(EXEC_TIME, &labels).record(exec_time.as_secs_f64());
    histogram!(TOTAL_TIME, &labels).record((queue_wait + exec_time).as_secs_f64());
}

/// Records a rate limit hit.
pub fn record_rate_limit_hit(endpoint: &str) {
    counter!(RATE_LIMIT_HITS, "endpoint" => endpoint.to_string()).increment(1);
}

fn non_empty(label: &str) -> String {
    if label.is_empty() {
        "unknown".to_string()
    } else {
        label.to_string()
    }
}

/// Handler for the `/metrics` endpoint.
///
/// Returns Prometheus-formatted metrics text.
pub async fn serve_metrics() -> impl IntoResponse {
    prometheus_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain; charset=utf-8")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric_lines<'a>(metrics: &'a str, name: &str) -> Vec<&'a str> {
        metrics
            .lines()
            .filter(|line| line.starts_with(name))
            .collect()
    }

    #[test]
    fn test_infer_request_labels() {
        let handle = init_metrics();
        record_infer_request(StatusCode::OK, "test", "stub");
        record_infer_request(StatusCode::TOO_MANY_REQUESTS, "", "stub");

        let rendered = handle.render();
        let lines = metric_lines(&rendered, INFER_REQUESTS);
        assert!(!lines.is_empty());
        assert!(lines.iter().any(|l| l.contains(r#"status="200""#)
            && l.contains(r#"provider="test""#)));
        assert!(lines.iter().any(|l| l.contains(r#"status="429""#)
            && l.contains(r#"provider="unknown""#)));
    }

    #[test]
    fn test_timings_render_all_three_histograms() {
        let handle = init_metrics();
        record_infer_timings(
            "test",
            "stub",
            Duration::from_millis(5),
            Duration::from_millis(20),
        );

        let rendered = handle.render();
        for name in [QUEUE_WAIT, EXEC_TIME, TOTAL_TIME] {
            assert!(
                rendered.contains(name),
                "missing histogram {name} in exposition"
            );
        }
    }
}
