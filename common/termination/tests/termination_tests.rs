use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use termination::{
    Coordinator, CoordinatorState, DrainOutcome, HttpListener, Listener, ListenerError,
    ListenerState, PreDrainHook, ShutdownStatus, TerminationRequest, WaitOutcome,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::MakeWriter;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Coordinator with the documented 5s / 30s deadlines and no signal trapping, so tests
/// never race real signals.
fn test_coordinator() -> Coordinator {
    Coordinator::builder("test")
        .with_trap_signals(false)
        .with_drain_deadline(Duration::from_secs(5))
        .with_grace_period(Duration::from_secs(30))
        .build()
}

/// Listener double: serves until stopped, then answers `stop` with a canned outcome.
struct MockListener {
    outcome: DrainOutcome,
    fail_on_serve: bool,
    stops: AtomicUsize,
    stopped: CancellationToken,
    state: Mutex<ListenerState>,
}

impl MockListener {
    fn new(outcome: DrainOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            fail_on_serve: false,
            stops: AtomicUsize::new(0),
            stopped: CancellationToken::new(),
            state: Mutex::new(ListenerState::NotStarted),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            outcome: DrainOutcome::AlreadyFailed,
            fail_on_serve: true,
            stops: AtomicUsize::new(0),
            stopped: CancellationToken::new(),
            state: Mutex::new(ListenerState::NotStarted),
        })
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Listener for MockListener {
    async fn serve(&self) -> Result<(), ListenerError> {
        if self.fail_on_serve {
            *self.state.lock().unwrap() = ListenerState::Failed;
            return Err(ListenerError::Accept(io::Error::other("accept exploded")));
        }
        *self.state.lock().unwrap() = ListenerState::Accepting;
        self.stopped.cancelled().await;
        Ok(())
    }

    async fn stop(&self, _deadline: Duration) -> DrainOutcome {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = ListenerState::Stopped;
        self.stopped.cancel();
        self.outcome.clone()
    }

    fn state(&self) -> ListenerState {
        *self.state.lock().unwrap()
    }
}

/// Dispatch `durations.len()` units on the coordinator's tracker, the way a request handler
/// does, and return a counter of finished units.
fn dispatch(coordinator: &Coordinator, durations: &[u64]) -> Arc<AtomicUsize> {
    let finished = Arc::new(AtomicUsize::new(0));
    let tracker = coordinator.tracker();
    for (i, secs) in durations.iter().copied().enumerate() {
        let finished = finished.clone();
        tracker.spawn(format!("job{}", i + 1), async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }
    finished
}

// ---------------------------------------------------------------------------
// Shutdown scenarios
// ---------------------------------------------------------------------------

/// Drain and work both finish: three units of 1-4s under 5s / 30s deadlines.
#[tokio::test(start_paused = true)]
async fn clean_shutdown_waits_for_all_units() {
    let coordinator = test_coordinator();
    let listener = MockListener::new(DrainOutcome::Drained);
    let finished = dispatch(&coordinator, &[1, 4, 2]);

    coordinator
        .trigger()
        .fire(TerminationRequest::Programmatic);
    let report = coordinator.run(listener.clone()).await;

    assert_eq!(report.status, ShutdownStatus::Clean);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.request, Some(TerminationRequest::Programmatic));
    assert_eq!(report.drain, Some(DrainOutcome::Drained));
    assert_eq!(report.work, Some(WaitOutcome::Finished));
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert!(report.elapsed >= Duration::from_secs(4));
    assert!(report.elapsed < Duration::from_secs(5));
    assert_eq!(
        coordinator.state(),
        CoordinatorState::Exited(ShutdownStatus::Clean)
    );
}

/// A unit that never completes exhausts the 30s grace period: degraded, but exit 0.
#[tokio::test(start_paused = true)]
async fn grace_period_exceeded_is_degraded() {
    let coordinator = test_coordinator();
    let listener = MockListener::new(DrainOutcome::Drained);
    let finished = dispatch(&coordinator, &[1, 2, 3]);
    let _stuck = coordinator.tracker().begin("job4 very slow");

    coordinator
        .trigger()
        .fire(TerminationRequest::Interrupt);
    let start = Instant::now();
    let report = coordinator.run(listener).await;

    assert_eq!(report.status, ShutdownStatus::Degraded);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.work, Some(WaitOutcome::TimedOut { outstanding: 1 }));
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= Duration::from_secs(30));
    assert!(start.elapsed() <= Duration::from_secs(30) + Duration::from_millis(5));
}

/// Connections closed at the drain deadline make the exit non-zero; work is still awaited.
#[tokio::test(start_paused = true)]
async fn forced_drain_fails_but_still_waits_for_work() {
    let coordinator = test_coordinator();
    let listener = MockListener::new(DrainOutcome::ForcedClose { closed: 2 });
    let finished = dispatch(&coordinator, &[3]);

    coordinator.trigger().fire(TerminationRequest::Terminate);
    let report = coordinator.run(listener).await;

    assert_eq!(report.status, ShutdownStatus::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.work, Some(WaitOutcome::Finished));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

/// A drain that errors must not skip the work phase.
#[tokio::test(start_paused = true)]
async fn failed_drain_still_waits_for_work() {
    let coordinator = test_coordinator();
    let listener = MockListener::new(DrainOutcome::Failed {
        reason: "transport refused to halt".to_string(),
    });
    let finished = dispatch(&coordinator, &[2, 3]);

    coordinator.trigger().fire(TerminationRequest::Terminate);
    let report = coordinator.run(listener).await;

    assert_eq!(report.status, ShutdownStatus::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.work, Some(WaitOutcome::Finished));
    assert_eq!(finished.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn zero_grace_period_does_not_wait() {
    let coordinator = Coordinator::builder("test")
        .with_trap_signals(false)
        .with_grace_period(Duration::ZERO)
        .build();
    let listener = MockListener::new(DrainOutcome::Drained);
    dispatch(&coordinator, &[10]);

    coordinator.trigger().fire(TerminationRequest::Terminate);
    let start = Instant::now();
    let report = coordinator.run(listener).await;

    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(report.status, ShutdownStatus::Degraded);
    assert_eq!(report.work, Some(WaitOutcome::TimedOut { outstanding: 1 }));
}

#[tokio::test(start_paused = true)]
async fn zero_grace_period_with_no_work_is_clean() {
    let coordinator = Coordinator::builder("test")
        .with_trap_signals(false)
        .with_grace_period(Duration::ZERO)
        .build();
    let listener = MockListener::new(DrainOutcome::Drained);

    coordinator.trigger().fire(TerminationRequest::Terminate);
    let report = coordinator.run(listener).await;

    assert_eq!(report.status, ShutdownStatus::Clean);
    assert_eq!(report.work, Some(WaitOutcome::Finished));
}

/// Listener start-up/accept failure before any trigger: exit non-zero, no sequence.
#[tokio::test(start_paused = true)]
async fn listener_failure_before_trigger_skips_sequence() {
    let coordinator = test_coordinator();
    let listener = MockListener::failing();
    let _pending = coordinator.tracker().begin("never waited for");

    let report = tokio::time::timeout(Duration::from_secs(1), coordinator.run(listener.clone()))
        .await
        .expect("a failed listener must not wait for the grace period");

    assert_eq!(report.status, ShutdownStatus::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.drain, None);
    assert_eq!(report.work, None);
    assert!(report
        .listener_error
        .as_deref()
        .is_some_and(|e| e.contains("accept exploded")));
    assert_eq!(listener.stops(), 0);
    assert_eq!(
        coordinator.state(),
        CoordinatorState::Exited(ShutdownStatus::Failed)
    );
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn duplicate_triggers_drive_one_sequence() {
    let coordinator = Arc::new(test_coordinator());
    let listener = MockListener::new(DrainOutcome::Drained);
    dispatch(&coordinator, &[1]);

    let run = {
        let coordinator = coordinator.clone();
        let listener = listener.clone();
        tokio::spawn(async move { coordinator.run(listener).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    let trigger = coordinator.trigger();
    assert!(trigger.fire(TerminationRequest::Interrupt));
    assert!(!trigger.fire(TerminationRequest::Interrupt));
    assert!(!trigger.fire(TerminationRequest::Terminate));

    let report = run.await.unwrap();
    assert_eq!(report.request, Some(TerminationRequest::Interrupt));
    assert_eq!(report.status, ShutdownStatus::Clean);
    assert_eq!(listener.stops(), 1);

    // Late triggers after exit change nothing.
    assert!(!trigger.fire(TerminationRequest::Terminate));
    assert_eq!(
        coordinator.state(),
        CoordinatorState::Exited(ShutdownStatus::Clean)
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_shutdown_calls_share_one_report() {
    let coordinator = test_coordinator();
    let listener = MockListener::new(DrainOutcome::Drained);
    dispatch(&coordinator, &[2]);
    coordinator.trigger().fire(TerminationRequest::Programmatic);

    let (first, second) = tokio::join!(
        coordinator.shutdown(listener.as_ref()),
        coordinator.shutdown(listener.as_ref()),
    );

    assert_eq!(first.status, ShutdownStatus::Clean);
    assert_eq!(second.status, ShutdownStatus::Clean);
    assert_eq!(first.elapsed, second.elapsed);
    assert_eq!(listener.stops(), 1);
}

/// A trigger that arrives before the listener starts accepting is still honoured.
#[tokio::test]
async fn trigger_before_accepting_is_honoured() {
    let coordinator = test_coordinator();
    let socket = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let router = Router::new().route("/", get(|| async { "hello" }));
    let listener = Arc::new(HttpListener::from_tcp(socket, router).unwrap());

    coordinator.trigger().fire(TerminationRequest::Terminate);
    let report = tokio::time::timeout(Duration::from_secs(5), coordinator.run(listener.clone()))
        .await
        .expect("shutdown should not wait for any deadline");

    assert_eq!(report.status, ShutdownStatus::Clean);
    assert_eq!(report.drain, Some(DrainOutcome::Drained));
    assert_eq!(listener.state(), ListenerState::Stopped);
}

// ---------------------------------------------------------------------------
// Pre-drain hooks
// ---------------------------------------------------------------------------

struct RecordingHook {
    name: &'static str,
    fail: bool,
    listener: Arc<MockListener>,
    stops_seen: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl PreDrainHook for RecordingHook {
    fn name(&self) -> &str {
        self.name
    }

    async fn before_drain(&self) -> anyhow::Result<()> {
        self.stops_seen.lock().unwrap().push(self.listener.stops());
        if self.fail {
            anyhow::bail!("service discovery unreachable");
        }
        Ok(())
    }
}

struct HangingHook;

#[async_trait]
impl PreDrainHook for HangingHook {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn before_drain(&self) -> anyhow::Result<()> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn pre_drain_hooks_run_before_drain_and_never_block_it() {
    let listener = MockListener::new(DrainOutcome::Drained);
    let stops_seen = Arc::new(Mutex::new(Vec::new()));
    let coordinator = Coordinator::builder("test")
        .with_trap_signals(false)
        .with_drain_deadline(Duration::from_secs(5))
        .with_pre_drain_hook(RecordingHook {
            name: "deregister",
            fail: true,
            listener: listener.clone(),
            stops_seen: stops_seen.clone(),
        })
        .with_pre_drain_hook(HangingHook)
        .with_pre_drain_hook(RecordingHook {
            name: "flush",
            fail: false,
            listener: listener.clone(),
            stops_seen: stops_seen.clone(),
        })
        .build();

    coordinator.trigger().fire(TerminationRequest::Terminate);
    let start = Instant::now();
    let report = coordinator.run(listener.clone()).await;

    assert_eq!(report.status, ShutdownStatus::Clean);
    assert_eq!(*stops_seen.lock().unwrap(), vec![0, 0]);
    assert_eq!(listener.stops(), 1);
    // The hanging hook costs at most one drain deadline.
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(start.elapsed() < Duration::from_secs(6));
}

// ---------------------------------------------------------------------------
// Lifecycle events
// ---------------------------------------------------------------------------

/// In-memory log sink for a `fmt` subscriber.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// One event per state transition, in sequence order, with every unit finishing before
/// the exit event.
#[tokio::test(start_paused = true)]
async fn each_transition_logs_one_event_in_order() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(Level::INFO)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let coordinator = test_coordinator();
    let listener = MockListener::new(DrainOutcome::Drained);
    let tracker = coordinator.tracker();
    for (name, secs) in [("job1", 1), ("job2", 4), ("job3", 2)] {
        tracker.spawn(name, async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!(job = name, "finished job");
        });
    }

    coordinator
        .trigger()
        .fire(TerminationRequest::Programmatic);
    let report = coordinator.run(listener).await;
    assert_eq!(report.status, ShutdownStatus::Clean);

    let lines = logs.lines();
    let position = |message: &str| {
        let matching: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.contains(message))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(matching.len(), 1, "expected one {message:?} event in {lines:#?}");
        matching[0]
    };

    let sequence: Vec<usize> = [
        "Termination: shutdown requested",
        "Termination: draining listener",
        "Termination: listener drained",
        "Termination: waiting for work units to finish",
        "Termination: all work units finished",
        "Termination: exiting",
    ]
    .into_iter()
    .map(position)
    .collect();
    assert!(sequence.windows(2).all(|pair| pair[0] < pair[1]));

    let waiting = sequence[3];
    let exiting = sequence[5];
    let finished_jobs: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.contains("finished job"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(finished_jobs.len(), 3);
    assert!(finished_jobs.iter().all(|&i| waiting < i && i < exiting));
}
