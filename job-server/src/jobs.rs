use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use termination::WorkTracker;
use tracing::info;

/// Whether dispatched jobs are registered with the shutdown tracker.
///
/// `Untracked` reproduces the naive server: the process exits as soon as the listener
/// has drained, killing any job still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracking {
    Tracked,
    Untracked,
}

impl Tracking {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tracking::Tracked => "tracked",
            Tracking::Untracked => "untracked",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseTrackingError(String);

impl FromStr for Tracking {
    type Err = ParseTrackingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tracked" => Ok(Tracking::Tracked),
            "untracked" => Ok(Tracking::Untracked),
            _ => Err(ParseTrackingError(s.to_owned())),
        }
    }
}

/// The jobs one request fans out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPlan {
    pub count: usize,
    pub min_duration: Duration,
    pub max_duration: Duration,
    /// Duration of an extra job appended after the regular ones, if any.
    pub stuck_job: Option<Duration>,
}

impl JobPlan {
    /// Names and durations for one request: job1..jobN with random durations, plus the
    /// slow job when configured.
    pub fn jobs(&self) -> Vec<(String, Duration)> {
        let mut rng = rand::thread_rng();
        let mut jobs: Vec<(String, Duration)> = (1..=self.count)
            .map(|i| {
                let duration = rng.gen_range(self.min_duration..=self.max_duration);
                (format!("job{i}"), duration)
            })
            .collect();

        if let Some(duration) = self.stuck_job {
            jobs.push((format!("job{} very slow", self.count + 1), duration));
        }

        jobs
    }
}

/// Fans each request out to background jobs, through the tracker or around it.
pub struct Dispatcher {
    tracking: Tracking,
    tracker: WorkTracker,
    plan: JobPlan,
    dispatched: AtomicUsize,
    finished: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(tracking: Tracking, tracker: WorkTracker, plan: JobPlan) -> Self {
        Self {
            tracking,
            tracker,
            plan,
            dispatched: AtomicUsize::new(0),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn tracking(&self) -> Tracking {
        self.tracking
    }

    /// Start every job of the plan. Tracked jobs are registered before this returns, so
    /// the caller can respond knowing the shutdown sequence will wait for them.
    pub fn dispatch(&self) -> usize {
        let jobs = self.plan.jobs();
        let count = jobs.len();

        for (name, duration) in jobs {
            let finished = self.finished.clone();
            match self.tracking {
                Tracking::Tracked => {
                    let job_name = name.clone();
                    self.tracker.spawn(name, run_job(job_name, duration, finished));
                }
                Tracking::Untracked => {
                    tokio::spawn(run_job(name, duration, finished));
                }
            }
        }

        self.dispatched.fetch_add(count, Ordering::SeqCst);
        metrics::counter!("jobs_dispatched_total", "tracking" => self.tracking.as_str())
            .increment(count as u64);

        count
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn unfinished(&self) -> usize {
        self.dispatched().saturating_sub(self.finished())
    }
}

async fn run_job(name: String, duration: Duration, finished: Arc<AtomicUsize>) {
    info!(role = "server", job = %name, duration_ms = duration.as_millis() as u64, "starting job");

    tokio::time::sleep(duration).await;

    finished.fetch_add(1, Ordering::SeqCst);
    metrics::counter!("jobs_finished_total").increment(1);
    info!(role = "server", job = %name, "finished job");
}
