mod app;
mod jobs;

pub use app::{app, AppState};
