//! One-shot termination trigger.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::metrics;

/// What asked the process to terminate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationRequest {
    /// SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// [`Trigger::fire`] called from code.
    Programmatic,
}

impl TerminationRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationRequest::Interrupt => "interrupt",
            TerminationRequest::Terminate => "terminate",
            TerminationRequest::Programmatic => "programmatic",
        }
    }
}

impl fmt::Display for TerminationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latched, one-shot notification channel. Only the first [`fire`](Trigger::fire) is
/// recorded; later ones are logged and dropped. A request fired before anyone listens is
/// kept, so [`recv`](Trigger::recv) returns it as soon as it is awaited.
#[derive(Clone)]
pub struct Trigger {
    request: Arc<watch::Sender<Option<TerminationRequest>>>,
}

impl Trigger {
    pub fn new() -> Self {
        let (request, _) = watch::channel(None);
        Self {
            request: Arc::new(request),
        }
    }

    /// Request termination. Returns `true` if this was the first request.
    pub fn fire(&self, request: TerminationRequest) -> bool {
        let mut first = false;
        self.request.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(request);
            first = true;
            true
        });

        if first {
            debug!(trigger = %request, "Termination: trigger fired");
        } else {
            metrics::emit_duplicate_trigger(request.as_str());
            warn!(
                trigger = %request,
                "Termination: ignoring duplicate trigger, shutdown already in progress"
            );
        }
        first
    }

    /// The request that won, if any.
    pub fn fired(&self) -> Option<TerminationRequest> {
        *self.request.borrow()
    }

    pub fn is_fired(&self) -> bool {
        self.fired().is_some()
    }

    /// Resolve with the first request, immediately if one was already fired.
    pub async fn recv(&self) -> TerminationRequest {
        let mut rx = self.request.subscribe();
        if let Ok(request) = rx.wait_for(Option::is_some).await {
            if let Some(request) = *request {
                return request;
            }
        }
        // The sender is owned by `self`, the channel can't close under us.
        std::future::pending().await
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}
