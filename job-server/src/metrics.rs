use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Counts requests still being handled, which is what the listener drain waits on, and
/// records per-route latency once each response is produced.
pub async fn track_metrics(
    matched_path: Option<MatchedPath>,
    req: Request,
    next: Next,
) -> Response {
    let route = matched_path.map_or_else(
        || req.uri().path().to_owned(),
        |path| path.as_str().to_owned(),
    );
    let method = req.method().as_str().to_owned();

    let in_flight = metrics::gauge!("job_server_requests_in_flight");
    in_flight.increment(1.0);
    let start = Instant::now();
    let response = next.run(req).await;
    in_flight.decrement(1.0);

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("job_server_requests_total", &labels).increment(1);
    metrics::histogram!("job_server_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
