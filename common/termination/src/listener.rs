//! Listener lifecycle: accept loop, bounded drain and forced closure of connections.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ConnectInfo;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::error::ListenerError;

/// Slack given to the serving task to report its drain result after the deadline fired.
/// A listener that stays silent past `deadline + HALT_TOLERANCE` is reported as failed.
const HALT_TOLERANCE: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    NotStarted,
    Accepting,
    Draining,
    Stopped,
    Failed,
}

/// The drain the first `stop` call started. Later callers are bounded by it, not by the
/// deadline they passed themselves.
#[derive(Clone, Copy, Debug)]
struct DrainWindow {
    started: Instant,
    deadline: Duration,
}

impl DrainWindow {
    fn halt_by(&self) -> Instant {
        self.started + self.deadline + HALT_TOLERANCE
    }
}

/// Result of [`Listener::stop`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every accepted connection finished before the deadline.
    Drained,
    /// The deadline elapsed; `closed` connections were dropped mid-flight.
    ForcedClose { closed: usize },
    /// The listener had already failed before the stop request.
    AlreadyFailed,
    /// The listener did not confirm that it halted.
    Failed { reason: String },
}

impl DrainOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainOutcome::Drained => "drained",
            DrainOutcome::ForcedClose { .. } => "forced_close",
            DrainOutcome::AlreadyFailed => "already_failed",
            DrainOutcome::Failed { .. } => "failed",
        }
    }
}

/// A network listener the [`Coordinator`](crate::Coordinator) can serve and drain.
///
/// Implementations own connection-level accept/close only. Background work spawned by
/// requests is the [`WorkTracker`](crate::WorkTracker)'s business.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Accept connections until the listener is stopped or fails.
    async fn serve(&self) -> Result<(), ListenerError>;

    /// Stop accepting, give in-flight requests up to `deadline` to complete, then close
    /// whatever is left. Safe to call more than once and from several tasks at a time:
    /// every caller observes the outcome of the single drain.
    async fn stop(&self, deadline: Duration) -> DrainOutcome;

    fn state(&self) -> ListenerState;
}

/// HTTP listener serving an axum [`Router`] over HTTP/1 and HTTP/2.
#[derive(Clone)]
pub struct HttpListener {
    inner: Arc<Inner>,
}

struct Inner {
    router: Router,
    local_addr: SocketAddr,
    socket: Mutex<Option<TcpListener>>,
    state: watch::Sender<ListenerState>,
    outcome: watch::Sender<Option<DrainOutcome>>,
    drain_window: Mutex<Option<DrainWindow>>,
    drain: CancellationToken,
    force: CancellationToken,
}

impl HttpListener {
    /// Bind `addr`. A failure here is a start-up failure: no shutdown sequence should follow.
    pub async fn bind(addr: &str, router: Router) -> Result<Self, ListenerError> {
        let socket = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.to_owned(),
                source,
            })?;
        Self::from_tcp(socket, router)
    }

    /// Adopt an already bound socket.
    pub fn from_tcp(socket: TcpListener, router: Router) -> Result<Self, ListenerError> {
        let local_addr = socket.local_addr().map_err(|source| ListenerError::Bind {
            addr: "adopted socket".to_owned(),
            source,
        })?;
        let (state, _) = watch::channel(ListenerState::NotStarted);
        let (outcome, _) = watch::channel(None);

        Ok(Self {
            inner: Arc::new(Inner {
                router,
                local_addr,
                socket: Mutex::new(Some(socket)),
                state,
                outcome,
                drain_window: Mutex::new(None),
                drain: CancellationToken::new(),
                force: CancellationToken::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    async fn accept_loop(&self, socket: TcpListener) -> Result<(), ListenerError> {
        let builder = AutoBuilder::new(TokioExecutor::new());
        let graceful = GracefulShutdown::new();
        let connections = TaskTracker::new();

        loop {
            tokio::select! {
                biased;

                _ = self.inner.drain.cancelled() => break,
                result = socket.accept() => {
                    let (stream, remote_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) if is_connection_error(&e) => {
                            debug!(error = %e, "Termination: connection failed during accept");
                            continue;
                        }
                        Err(e) => {
                            self.fail(&connections, &e);
                            return Err(ListenerError::Accept(e));
                        }
                    };

                    // Match axum default: set TCP_NODELAY for low-latency
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(error = %e, "Termination: failed to set TCP_NODELAY");
                    }

                    let router = self.inner.router.clone();
                    let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let mut router = router.clone();
                        let mut req = req.map(axum::body::Body::new);
                        req.extensions_mut().insert(ConnectInfo(remote_addr));
                        async move { router.call(req).await }
                    });

                    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                    let conn = graceful.watch(conn.into_owned());
                    let force = self.inner.force.clone();

                    connections.spawn(async move {
                        tokio::select! {
                            result = conn => {
                                if let Err(e) = result {
                                    debug!(error = %e, "Termination: connection closed with error");
                                }
                            }
                            _ = force.cancelled() => {
                                debug!(remote = %remote_addr, "Termination: connection force-closed");
                            }
                        }
                    });
                }
            }
        }

        // Dropping the socket makes the kernel refuse new connections from here on.
        drop(socket);
        connections.close();

        let window = *lock(&self.inner.drain_window);
        let deadline = window.map_or(Duration::ZERO, |w| w.deadline);
        let drain_clock = Instant::now();
        info!(
            deadline_secs = deadline.as_secs_f64(),
            connections = connections.len(),
            "Termination: listener draining"
        );

        let outcome = match tokio::time::timeout(deadline, graceful.shutdown()).await {
            Ok(()) => DrainOutcome::Drained,
            Err(_) => {
                let closed = connections.len();
                self.inner.force.cancel();
                DrainOutcome::ForcedClose { closed }
            }
        };
        connections.wait().await;

        match &outcome {
            DrainOutcome::ForcedClose { closed } => warn!(
                closed = *closed,
                duration_secs = drain_clock.elapsed().as_secs_f64(),
                "Termination: listener stopped, drain deadline reached"
            ),
            _ => info!(
                duration_secs = drain_clock.elapsed().as_secs_f64(),
                "Termination: listener stopped"
            ),
        }
        self.inner.state.send_replace(ListenerState::Stopped);
        self.inner.outcome.send_replace(Some(outcome));
        Ok(())
    }

    fn fail(&self, connections: &TaskTracker, e: &io::Error) {
        error!(error = %e, "Termination: listener failed");
        self.inner.force.cancel();
        connections.close();
        self.inner.state.send_replace(ListenerState::Failed);
        self.inner
            .outcome
            .send_replace(Some(DrainOutcome::AlreadyFailed));
    }
}

#[async_trait]
impl Listener for HttpListener {
    async fn serve(&self) -> Result<(), ListenerError> {
        let socket = lock(&self.inner.socket).take();
        let Some(socket) = socket else {
            return match self.state() {
                ListenerState::Stopped => Ok(()),
                _ => Err(ListenerError::AlreadyServing),
            };
        };

        let started = self.inner.state.send_if_modified(|state| {
            if *state != ListenerState::NotStarted {
                return false;
            }
            *state = ListenerState::Accepting;
            true
        });
        if !started {
            info!("Termination: listener stopped before it started accepting");
            return Ok(());
        }

        info!(address = %self.inner.local_addr, "Termination: listener accepting");
        self.accept_loop(socket).await
    }

    async fn stop(&self, deadline: Duration) -> DrainOutcome {
        let requested = DrainWindow {
            started: Instant::now(),
            deadline,
        };
        let mut previous = ListenerState::NotStarted;
        self.inner.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                ListenerState::NotStarted => {
                    *state = ListenerState::Stopped;
                    true
                }
                ListenerState::Accepting => {
                    // Recorded under the state lock so joining callers always find it.
                    *lock(&self.inner.drain_window) = Some(requested);
                    *state = ListenerState::Draining;
                    true
                }
                _ => false,
            }
        });

        match previous {
            ListenerState::NotStarted => {
                drop(lock(&self.inner.socket).take());
                self.inner
                    .outcome
                    .send_replace(Some(DrainOutcome::Drained));
                info!("Termination: listener stopped before accepting any connection");
                return DrainOutcome::Drained;
            }
            ListenerState::Accepting => self.inner.drain.cancel(),
            ListenerState::Failed => return DrainOutcome::AlreadyFailed,
            ListenerState::Draining | ListenerState::Stopped => {
                debug!("Termination: listener stop already requested, awaiting its outcome");
            }
        }

        let window = (*lock(&self.inner.drain_window)).unwrap_or(requested);
        let limit = window.deadline + HALT_TOLERANCE;
        let mut rx = self.inner.outcome.subscribe();
        let halted = tokio::time::timeout_at(window.halt_by(), rx.wait_for(Option::is_some)).await;
        let outcome = match halted {
            Ok(Ok(outcome)) => outcome.clone(),
            _ => None,
        };

        outcome.unwrap_or_else(|| {
            warn!(
                limit_secs = limit.as_secs_f64(),
                "Termination: listener did not confirm it halted"
            );
            DrainOutcome::Failed {
                reason: format!("listener did not halt within {limit:?}"),
            }
        })
    }

    fn state(&self) -> ListenerState {
        *self.inner.state.borrow()
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
