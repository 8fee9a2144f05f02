use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;

use crate::jobs::{JobPlan, Tracking};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "127.0.0.1")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "job-server")]
    pub service_name: String,

    #[envconfig(default = "5000")]
    pub drain_deadline_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub grace_period_ms: EnvMsDuration,

    #[envconfig(default = "tracked")]
    pub tracking: Tracking,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(nested = true)]
    pub jobs: JobConfig,

    #[envconfig(nested = true)]
    pub mock_client: MockClientConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct JobConfig {
    #[envconfig(default = "3")]
    pub job_count: usize,

    #[envconfig(default = "1000")]
    pub job_min_duration_ms: EnvMsDuration,

    #[envconfig(default = "4000")]
    pub job_max_duration_ms: EnvMsDuration,

    /// Add one extra job that outlives any sensible grace period.
    #[envconfig(default = "false")]
    pub stuck_job: bool,

    #[envconfig(default = "3600000")]
    pub stuck_job_duration_ms: EnvMsDuration,
}

impl JobConfig {
    pub fn plan(&self) -> Result<JobPlan, ConfigError> {
        let min = self.job_min_duration_ms.0;
        let max = self.job_max_duration_ms.0;
        if min > max {
            return Err(ConfigError::InvalidJobDurations { min, max });
        }

        Ok(JobPlan {
            count: self.job_count,
            min_duration: min,
            max_duration: max,
            stuck_job: self.stuck_job.then_some(self.stuck_job_duration_ms.0),
        })
    }
}

#[derive(Envconfig, Clone)]
pub struct MockClientConfig {
    #[envconfig(from = "MOCK_CLIENT", default = "true")]
    pub enabled: bool,

    #[envconfig(default = "1000")]
    pub mock_request_delay_ms: EnvMsDuration,

    #[envconfig(default = "2000")]
    pub mock_trigger_delay_ms: EnvMsDuration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("job min duration {min:?} is greater than max duration {max:?}")]
    InvalidJobDurations {
        min: time::Duration,
        max: time::Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
