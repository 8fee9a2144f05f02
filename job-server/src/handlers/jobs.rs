use axum::extract::State;
use tracing::debug;

use super::app::AppState;

/// Fan the request out to background jobs and answer before any of them finishes.
pub async fn start_jobs(State(state): State<AppState>) -> &'static str {
    let dispatched = state.dispatcher.dispatch();
    debug!(
        dispatched,
        tracking = state.dispatcher.tracking().as_str(),
        "dispatched jobs"
    );

    "job started"
}
