//! K8s readiness and liveness probe handlers.

use axum::http::StatusCode;

use crate::trigger::Trigger;

/// Readiness probe: 200 until a termination trigger fires, 503 afterwards, so load
/// balancers stop routing before the listener closes.
#[derive(Clone)]
pub struct ReadinessHandler {
    trigger: Trigger,
}

impl ReadinessHandler {
    pub fn new(trigger: Trigger) -> Self {
        Self { trigger }
    }

    /// No I/O, safe to call from any request.
    pub async fn check(&self) -> StatusCode {
        if self.trigger.is_fired() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        }
    }
}

/// Liveness probe. Stays 200 through shutdown, since a draining process is not stuck;
/// the body tells the two phases apart.
#[derive(Clone)]
pub struct LivenessHandler {
    trigger: Trigger,
}

impl LivenessHandler {
    pub fn new(trigger: Trigger) -> Self {
        Self { trigger }
    }

    pub fn check(&self) -> (StatusCode, &'static str) {
        match self.trigger.fired() {
            None => (StatusCode::OK, "alive"),
            Some(_) => (StatusCode::OK, "alive, shutting down"),
        }
    }
}
