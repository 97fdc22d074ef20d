//! Prometheus metrics for quorumd.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a middleware for status server
//! request metrics, and exposes the `/metrics` endpoint handler.

use anyhow::Context;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Bootstrap decisions (counter). Labels: state, role.
pub const BOOTSTRAP_DECISIONS_TOTAL: &str = "quorumd_bootstrap_decisions_total";

/// Membership API requests (counter). Labels: operation, outcome.
pub const MEMBERSHIP_REQUESTS_TOTAL: &str = "quorumd_membership_requests_total";

/// Membership API request duration in seconds (histogram). Labels: operation.
pub const MEMBERSHIP_REQUEST_DURATION_SECONDS: &str =
    "quorumd_membership_request_duration_seconds";

/// Time from store launch to readiness in seconds (histogram).
pub const STORE_READY_SECONDS: &str = "quorumd_store_ready_seconds";

/// Startups where the recorded peer URLs differed from the configured ones.
pub const PEER_URL_MISMATCH_TOTAL: &str = "quorumd_peer_url_mismatch_total";

/// Status server requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "quorumd_http_requests_total";

/// Status server request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "quorumd_http_request_duration_seconds";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder.  Repeated calls return the
/// handle installed by the first one.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(
        BOOTSTRAP_DECISIONS_TOTAL,
        "Bootstrap decisions by initial cluster state and role"
    );
    describe_counter!(
        MEMBERSHIP_REQUESTS_TOTAL,
        "Membership API requests by operation and outcome"
    );
    describe_histogram!(
        MEMBERSHIP_REQUEST_DURATION_SECONDS,
        "Membership API request duration in seconds"
    );
    describe_histogram!(
        STORE_READY_SECONDS,
        "Seconds from consensus store launch to readiness"
    );
    describe_counter!(
        PEER_URL_MISMATCH_TOTAL,
        "Startups where recorded peer URLs differed from configured ones"
    );
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total status server requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "Status server request duration in seconds"
    );
}

// -- Metrics middleware -------------------------------------------------------

/// Records request count and latency for every status server request
/// except `/metrics` itself.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Collapse unknown paths into one label value.
fn normalize_path(path: &str) -> &'static str {
    match path {
        "/health" => "/health",
        "/status" => "/status",
        "/openapi.json" => "/openapi.json",
        _ => "/{other}",
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics are disabled").into_response(),
    }
}
