use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::trigger::{TerminationRequest, Trigger};

/// Forward SIGINT/SIGTERM to `trigger` for the lifetime of the process. Keeps listening
/// after the first signal so that repeated signals are reported as duplicates instead of
/// falling back to the default handler and killing the process mid-shutdown.
///
/// Handlers are installed before this returns. `None` if they could not be installed.
pub(crate) fn forward_signals(trigger: Trigger) -> Option<JoinHandle<()>> {
    let interrupt = install(SignalKind::interrupt(), "SIGINT")?;
    let terminate = install(SignalKind::terminate(), "SIGTERM")?;

    Some(tokio::spawn(forward(interrupt, terminate, trigger)))
}

fn install(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            error!(error = %e, signal = name, "Termination: failed to install signal handler");
            None
        }
    }
}

async fn forward(mut interrupt: Signal, mut terminate: Signal, trigger: Trigger) {
    loop {
        let request = tokio::select! {
            Some(()) = interrupt.recv() => TerminationRequest::Interrupt,
            Some(()) = terminate.recv() => TerminationRequest::Terminate,
            else => break,
        };
        info!(signal = %request, "Termination: received signal");
        trigger.fire(request);
    }
}
