//! Graceful termination for listener-based services that dispatch background work.
//!
//! A shutdown runs in two independent, bounded phases: the [`Listener`] stops accepting
//! and drains the connections it already accepted (drain deadline), then the
//! [`WorkTracker`] is awaited until every unit of work dispatched by handlers has ended
//! (grace period). The [`Coordinator`] owns the sequence, reacts to exactly one
//! termination trigger (OS signal or [`Trigger::fire`]) and produces a [`ShutdownReport`]
//! whose exit code the process should exit with.

mod coordinator;
mod error;
mod listener;
mod metrics;
mod readiness;
mod signals;
mod trigger;
mod work_tracker;

pub use coordinator::{
    Coordinator, CoordinatorBuilder, CoordinatorOptions, CoordinatorState, PreDrainHook,
    ShutdownReport, ShutdownStatus,
};
pub use error::ListenerError;
pub use listener::{DrainOutcome, HttpListener, Listener, ListenerState};
pub use readiness::{LivenessHandler, ReadinessHandler};
pub use trigger::{TerminationRequest, Trigger};
pub use work_tracker::{WaitOutcome, WorkGuard, WorkTracker};
