//! Listener error types.

use std::io;

use thiserror::Error;

/// Errors surfaced by [`Listener::serve`](crate::Listener::serve) and
/// [`HttpListener::bind`](crate::HttpListener::bind). Errors that happen once draining has
/// begun are never reported here; they are folded into a
/// [`DrainOutcome`](crate::DrainOutcome) instead.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The accept loop hit an error that is not tied to a single connection.
    #[error("failed to accept connections: {0}")]
    Accept(#[source] io::Error),

    /// `serve` was called while another `serve` call owns the socket.
    #[error("listener is already serving")]
    AlreadyServing,

    /// The task driving `serve` panicked or was cancelled.
    #[error("listener task ended abnormally: {0}")]
    ServeTaskAborted(String),
}
