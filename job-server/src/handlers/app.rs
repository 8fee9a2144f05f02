use std::sync::Arc;

use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use termination::{LivenessHandler, ReadinessHandler};
use tower_http::trace::TraceLayer;

use super::jobs;
use crate::jobs::Dispatcher;
use crate::metrics::track_metrics;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

pub fn app(
    state: AppState,
    readiness: ReadinessHandler,
    liveness: LivenessHandler,
    metrics: Option<PrometheusHandle>,
) -> Router {
    Router::new()
        .route("/", routing::get(jobs::start_jobs).post(jobs::start_jobs))
        .route(
            "/_readiness",
            routing::get(move || {
                let readiness = readiness.clone();
                async move { readiness.check().await }
            }),
        )
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.check())),
        )
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}
