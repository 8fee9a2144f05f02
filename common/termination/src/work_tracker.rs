//! Counter of in-flight units of work dispatched on behalf of requests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics;

/// Result of [`WorkTracker::wait`]. Timing out is an expected outcome, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every unit registered with the tracker has ended.
    Finished,
    /// The deadline elapsed first; `outstanding` units were still running.
    TimedOut { outstanding: usize },
}

impl WaitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitOutcome::Finished => "finished",
            WaitOutcome::TimedOut { .. } => "timed_out",
        }
    }
}

/// Shared count of outstanding units of work.
///
/// Handlers call [`begin`](WorkTracker::begin) (or [`spawn`](WorkTracker::spawn)) *before*
/// returning their response, so the count is already non-zero by the time the client
/// sees the reply. The returned [`WorkGuard`] ends the unit when dropped, which also covers
/// panics and aborted tasks.
///
/// The count lives behind a `watch` channel: every update happens under the channel's lock
/// and wakes waiters, and [`wait`](WorkTracker::wait) checks the current value before it
/// parks, so a transition to zero can't be missed.
#[derive(Clone)]
pub struct WorkTracker {
    outstanding: Arc<watch::Sender<usize>>,
}

impl WorkTracker {
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            outstanding: Arc::new(outstanding),
        }
    }

    /// Register one unit of work. The unit ends when the guard is dropped.
    pub fn begin(&self, name: impl Into<String>) -> WorkGuard {
        let name = name.into();
        let mut now = 0;
        self.outstanding.send_modify(|count| {
            *count += 1;
            now = *count;
        });
        metrics::emit_outstanding_work(now);
        debug!(unit = %name, outstanding = now, "Termination: work unit registered");

        WorkGuard {
            tracker: self.clone(),
            name,
        }
    }

    /// Register a unit synchronously, then run `work` on the runtime with the unit's guard
    /// moved into the task.
    pub fn spawn<F>(&self, name: impl Into<String>, work: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.begin(name);
        tokio::spawn(async move {
            let output = work.await;
            guard.end();
            output
        })
    }

    /// Number of units registered and not yet ended.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Wait until no unit is outstanding, or until `deadline` elapses.
    ///
    /// A zero deadline never parks: it reports the current state right away.
    pub async fn wait(&self, deadline: Duration) -> WaitOutcome {
        let mut rx = self.outstanding.subscribe();
        if deadline.is_zero() {
            return match *rx.borrow_and_update() {
                0 => WaitOutcome::Finished,
                outstanding => WaitOutcome::TimedOut { outstanding },
            };
        }

        // The sender lives as long as `self`, so `wait_for` can only resolve on a zero count.
        let finished = tokio::time::timeout(deadline, rx.wait_for(|count| *count == 0))
            .await
            .is_ok();

        if finished {
            WaitOutcome::Finished
        } else {
            WaitOutcome::TimedOut {
                outstanding: self.outstanding(),
            }
        }
    }

    fn end(&self, name: &str) {
        let mut underflow = false;
        let mut now = 0;
        self.outstanding.send_if_modified(|count| {
            if *count == 0 {
                underflow = true;
                return false;
            }
            *count -= 1;
            now = *count;
            true
        });

        if underflow {
            warn!(unit = %name, "Termination: work unit ended without being registered");
            return;
        }
        metrics::emit_outstanding_work(now);
        debug!(unit = %name, outstanding = now, "Termination: work unit ended");
    }
}

impl Default for WorkTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration of one unit of work; ends the unit exactly once, when dropped.
#[must_use = "dropping the guard ends the unit of work immediately"]
pub struct WorkGuard {
    tracker: WorkTracker,
    name: String,
}

impl WorkGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// End the unit now. Equivalent to dropping the guard.
    pub fn end(self) {
        drop(self);
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.tracker.end(&self.name);
    }
}
