//! Metrics implementation using Prometheus.

use agent_sandbox_core::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Upper bounds, in seconds, for command duration buckets.
const EXEC_DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Initialize Prometheus recorder and return the handle.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("sandbox_exec_duration_seconds".to_string()),
            EXEC_DURATION_BUCKETS,
        )
        .map_err(|e| Error::internal(format!("Invalid histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| Error::internal(format!("Failed to install Prometheus recorder: {}", e)))?;

    describe_metrics();
    tracing::info!("Prometheus metrics recorder initialized");
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(
        "sandbox_containers_created_total",
        "Session containers created and started"
    );
    metrics::describe_counter!(
        "sandbox_containers_destroyed_total",
        "Session containers stopped and removed, by reason"
    );
    metrics::describe_counter!("sandbox_reaped_total", "Idle containers removed by the reaper");
    metrics::describe_counter!("sandbox_exec_total", "Commands executed, by status");
    metrics::describe_histogram!(
        "sandbox_exec_duration_seconds",
        metrics::Unit::Seconds,
        "Wall time of command executions"
    );
    metrics::describe_gauge!("sandbox_active_containers", "Containers currently registered");
}

/// Helper to track HTTP request metrics (latency, count).
pub fn track_request(method: &str, path: &str, status: u16, latency_sec: f64) {
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string()
    )
    .record(latency_sec);
}

/// Record the number of registered containers.
pub fn set_active_containers(count: usize) {
    metrics::gauge!("sandbox_active_containers").set(count as f64);
}
