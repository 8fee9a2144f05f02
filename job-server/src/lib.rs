//! Demo service: every request fans out to background jobs that outlive the response,
//! and termination waits for them (or, untracked, abandons them).

pub mod config;
pub mod handlers;
pub mod jobs;
pub mod metrics;
pub mod mock_client;
