//! Termination coordinator: waits for one trigger, drains the listener, then waits for
//! outstanding work, each phase under its own deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, OnceCell};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::ListenerError;
use crate::listener::{DrainOutcome, Listener};
use crate::metrics;
use crate::readiness::{LivenessHandler, ReadinessHandler};
use crate::signals;
use crate::trigger::{TerminationRequest, Trigger};
use crate::work_tracker::{WaitOutcome, WorkTracker};

/// Options for a [`Coordinator`]; see [`Coordinator::builder`].
#[derive(Clone, Debug)]
pub struct CoordinatorOptions {
    pub name: String,
    /// Bound on stopping the listener while accepted requests finish.
    pub drain_deadline: Duration,
    /// Bound on waiting for dispatched units of work. Zero means "don't wait".
    pub grace_period: Duration,
    /// Turn SIGINT/SIGTERM into termination triggers (default: true).
    pub trap_signals: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            drain_deadline: Duration::from_secs(5),
            grace_period: Duration::from_secs(30),
            trap_signals: true,
        }
    }
}

/// Work to run after the trigger and before the listener drains, such as deregistering
/// from service discovery. Each hook gets at most the drain deadline; errors and timeouts
/// are logged and never hold up the shutdown.
#[async_trait]
pub trait PreDrainHook: Send + Sync {
    fn name(&self) -> &str;

    async fn before_drain(&self) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// Listener drained and every unit of work finished in time.
    Clean,
    /// Listener drained, but the grace period elapsed with units still running.
    Degraded,
    /// The listener failed before the trigger, failed to halt, or had connections
    /// force-closed at the drain deadline.
    Failed,
}

impl ShutdownStatus {
    fn from_phases(drain: &DrainOutcome, work: &WaitOutcome) -> Self {
        match (drain, work) {
            (DrainOutcome::Drained, WaitOutcome::Finished) => ShutdownStatus::Clean,
            (DrainOutcome::Drained, WaitOutcome::TimedOut { .. }) => ShutdownStatus::Degraded,
            _ => ShutdownStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownStatus::Clean => "clean",
            ShutdownStatus::Degraded => "degraded",
            ShutdownStatus::Failed => "failed",
        }
    }

    /// Degraded is still a performed shutdown and exits 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownStatus::Clean | ShutdownStatus::Degraded => 0,
            ShutdownStatus::Failed => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    ShutdownRequested,
    DrainingListener,
    WaitingForWork,
    Exited(ShutdownStatus),
}

impl CoordinatorState {
    fn rank(&self) -> u8 {
        match self {
            CoordinatorState::Running => 0,
            CoordinatorState::ShutdownRequested => 1,
            CoordinatorState::DrainingListener => 2,
            CoordinatorState::WaitingForWork => 3,
            CoordinatorState::Exited(_) => 4,
        }
    }
}

/// What happened during a shutdown, and how the process should exit.
#[derive(Clone, Debug)]
pub struct ShutdownReport {
    /// The trigger that started the sequence; `None` if the listener stopped on its own.
    pub request: Option<TerminationRequest>,
    /// `None` when the sequence was never entered (listener start-up failure).
    pub drain: Option<DrainOutcome>,
    pub work: Option<WaitOutcome>,
    pub listener_error: Option<String>,
    pub status: ShutdownStatus,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

pub struct CoordinatorBuilder {
    options: CoordinatorOptions,
    hooks: Vec<Box<dyn PreDrainHook>>,
}

impl CoordinatorBuilder {
    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.options.drain_deadline = deadline;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.options.grace_period = grace_period;
        self
    }

    pub fn with_trap_signals(mut self, trap_signals: bool) -> Self {
        self.options.trap_signals = trap_signals;
        self
    }

    pub fn with_pre_drain_hook(mut self, hook: impl PreDrainHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn build(self) -> Coordinator {
        let mut coordinator = Coordinator::new(self.options);
        coordinator.hooks = self.hooks;
        coordinator
    }
}

/// Owns the shutdown sequence of one process:
/// `running → shutdown-requested → draining-listener → waiting-for-work → exited`.
///
/// Hand [`tracker`](Coordinator::tracker) to every request handler that dispatches
/// background work, and [`trigger`](Coordinator::trigger) to anything that may ask for
/// termination programmatically.
pub struct Coordinator {
    options: CoordinatorOptions,
    hooks: Vec<Box<dyn PreDrainHook>>,
    tracker: WorkTracker,
    trigger: Trigger,
    state: watch::Sender<CoordinatorState>,
    report: OnceCell<ShutdownReport>,
}

impl Coordinator {
    pub fn builder(name: &str) -> CoordinatorBuilder {
        CoordinatorBuilder {
            options: CoordinatorOptions {
                name: name.to_string(),
                ..Default::default()
            },
            hooks: Vec::new(),
        }
    }

    pub fn new(options: CoordinatorOptions) -> Self {
        let (state, _) = watch::channel(CoordinatorState::Running);
        Self {
            options,
            hooks: Vec::new(),
            tracker: WorkTracker::new(),
            trigger: Trigger::new(),
            state,
            report: OnceCell::new(),
        }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    pub fn tracker(&self) -> WorkTracker {
        self.tracker.clone()
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger.clone()
    }

    /// Axum-compatible handler for `/_readiness`: 503 once a trigger fired.
    pub fn readiness_handler(&self) -> ReadinessHandler {
        ReadinessHandler::new(self.trigger.clone())
    }

    /// Axum-compatible handler for `/_liveness`.
    pub fn liveness_handler(&self) -> LivenessHandler {
        LivenessHandler::new(self.trigger.clone())
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Serve `listener` until a termination trigger arrives, then run the shutdown sequence.
    ///
    /// If the listener fails before any trigger, the sequence is skipped and the report is
    /// [`ShutdownStatus::Failed`].
    pub async fn run<L: Listener>(&self, listener: Arc<L>) -> ShutdownReport {
        let signals = if self.options.trap_signals {
            signals::forward_signals(self.trigger.clone())
        } else {
            None
        };

        let mut serving = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.serve().await })
        };

        let clock = Instant::now();
        let report = tokio::select! {
            biased;

            _ = self.await_trigger() => self.shutdown(listener.as_ref()).await,
            result = &mut serving => {
                let failure = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(e) => Some(ListenerError::ServeTaskAborted(e.to_string())),
                };
                match failure {
                    Some(e) => self.startup_failure(e, clock),
                    None => {
                        warn!("Termination: listener stopped without a termination trigger");
                        self.shutdown(listener.as_ref()).await
                    }
                }
            }
        };

        // The serving task ends with the drain; anything still running is wedged.
        if !serving.is_finished() {
            serving.abort();
        }
        if let Some(signals) = signals {
            signals.abort();
        }
        report
    }

    /// Wait for the first termination trigger. Later triggers are logged and ignored.
    pub async fn await_trigger(&self) -> TerminationRequest {
        let request = self.trigger.recv().await;
        if self.transition(CoordinatorState::ShutdownRequested) {
            metrics::emit_shutdown_initiated(&self.options.name, request.as_str());
            info!(trigger = %request, "Termination: shutdown requested");
        }
        request
    }

    /// Run the two shutdown phases once: drain the listener, then wait for outstanding
    /// work. Both phases always run. Concurrent or repeated calls get the same report.
    pub async fn shutdown<L: Listener + ?Sized>(&self, listener: &L) -> ShutdownReport {
        self.report
            .get_or_init(|| self.run_sequence(listener))
            .await
            .clone()
    }

    async fn run_sequence<L: Listener + ?Sized>(&self, listener: &L) -> ShutdownReport {
        let clock = Instant::now();
        let request = self.trigger.fired();
        let name = self.options.name.as_str();

        self.run_pre_drain_hooks().await;

        self.transition(CoordinatorState::DrainingListener);
        info!(
            deadline_secs = self.options.drain_deadline.as_secs_f64(),
            "Termination: draining listener"
        );
        let phase_clock = Instant::now();
        let drain = listener.stop(self.options.drain_deadline).await;
        metrics::emit_phase_duration(
            name,
            "drain",
            drain.as_str(),
            phase_clock.elapsed().as_secs_f64(),
        );
        match &drain {
            DrainOutcome::Drained => info!(result = drain.as_str(), "Termination: listener drained"),
            DrainOutcome::ForcedClose { closed } => warn!(
                result = drain.as_str(),
                closed = *closed,
                "Termination: drain deadline reached, remaining connections closed"
            ),
            DrainOutcome::AlreadyFailed => {
                error!(result = drain.as_str(), "Termination: listener had already failed")
            }
            DrainOutcome::Failed { reason } => error!(
                result = drain.as_str(),
                reason = %reason,
                "Termination: listener drain failed"
            ),
        }

        self.transition(CoordinatorState::WaitingForWork);
        info!(
            grace_period_secs = self.options.grace_period.as_secs_f64(),
            outstanding = self.tracker.outstanding(),
            "Termination: waiting for work units to finish"
        );
        let phase_clock = Instant::now();
        let work = self.tracker.wait(self.options.grace_period).await;
        metrics::emit_phase_duration(
            name,
            "work",
            work.as_str(),
            phase_clock.elapsed().as_secs_f64(),
        );
        match work {
            WaitOutcome::Finished => {
                info!(result = work.as_str(), "Termination: all work units finished")
            }
            WaitOutcome::TimedOut { outstanding } => warn!(
                result = work.as_str(),
                outstanding,
                "Termination: grace period elapsed, abandoning outstanding work units"
            ),
        }

        let status = ShutdownStatus::from_phases(&drain, &work);
        self.exit(ShutdownReport {
            request,
            drain: Some(drain),
            work: Some(work),
            listener_error: None,
            status,
            elapsed: clock.elapsed(),
        })
    }

    async fn run_pre_drain_hooks(&self) {
        for hook in &self.hooks {
            match tokio::time::timeout(self.options.drain_deadline, hook.before_drain()).await {
                Ok(Ok(())) => debug!(hook = hook.name(), "Termination: pre-drain hook completed"),
                Ok(Err(e)) => warn!(
                    hook = hook.name(),
                    error = %e,
                    "Termination: pre-drain hook failed"
                ),
                Err(_) => warn!(hook = hook.name(), "Termination: pre-drain hook timed out"),
            }
        }
    }

    fn startup_failure(&self, e: ListenerError, clock: Instant) -> ShutdownReport {
        error!(error = %e, "Termination: listener failed before any termination trigger");
        self.exit(ShutdownReport {
            request: None,
            drain: None,
            work: None,
            listener_error: Some(e.to_string()),
            status: ShutdownStatus::Failed,
            elapsed: clock.elapsed(),
        })
    }

    fn exit(&self, report: ShutdownReport) -> ShutdownReport {
        self.transition(CoordinatorState::Exited(report.status));
        metrics::emit_shutdown_completed(&self.options.name, report.status.as_str());
        match report.status {
            ShutdownStatus::Clean => info!(
                status = report.status.as_str(),
                exit_code = report.exit_code(),
                total_duration_secs = report.elapsed.as_secs_f64(),
                "Termination: exiting"
            ),
            ShutdownStatus::Degraded | ShutdownStatus::Failed => warn!(
                status = report.status.as_str(),
                exit_code = report.exit_code(),
                total_duration_secs = report.elapsed.as_secs_f64(),
                "Termination: exiting"
            ),
        }
        report
    }

    /// Move forward in the state machine; never backwards, never twice into the same state.
    fn transition(&self, next: CoordinatorState) -> bool {
        self.state.send_if_modified(|state| {
            if next.rank() <= state.rank() {
                return false;
            }
            *state = next;
            true
        })
    }
}
