use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use job_server::config::Config;
use job_server::handlers::{self, AppState};
use job_server::jobs::Dispatcher;
use job_server::metrics::setup_metrics_recorder;
use job_server::mock_client::MockClient;
use termination::{Coordinator, HttpListener};

async fn run(config: Config) -> Result<i32> {
    let plan = config.jobs.plan()?;

    let coordinator = Coordinator::builder(&config.service_name)
        .with_drain_deadline(config.drain_deadline_ms.0)
        .with_grace_period(config.grace_period_ms.0)
        .build();

    let dispatcher = Arc::new(Dispatcher::new(
        config.tracking,
        coordinator.tracker(),
        plan,
    ));

    let recorder_handle = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };

    let app = handlers::app(
        AppState {
            dispatcher: dispatcher.clone(),
        },
        coordinator.readiness_handler(),
        coordinator.liveness_handler(),
        recorder_handle,
    );

    let listener = HttpListener::bind(&config.bind(), app).await?;
    let address = listener.local_addr();
    info!(
        role = "server",
        %address,
        tracking = config.tracking.as_str(),
        "job server listening"
    );

    if config.mock_client.enabled {
        let client = MockClient::new(
            format!("http://{address}/"),
            config.mock_client.mock_request_delay_ms.0,
            config.mock_client.mock_trigger_delay_ms.0,
            coordinator.trigger(),
        );
        tokio::spawn(client.run());
    }

    let report = coordinator.run(Arc::new(listener)).await;

    let unfinished = dispatcher.unfinished();
    if unfinished > 0 {
        warn!(
            role = "server",
            unfinished,
            dispatched = dispatcher.dispatched(),
            "exiting with jobs still running"
        );
    }
    info!(
        role = "server",
        status = report.status.as_str(),
        exit_code = report.exit_code(),
        "job server exiting"
    );

    Ok(report.exit_code())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let code = match Config::init_from_env() {
        Ok(config) => match run(config).await {
            Ok(code) => code,
            Err(e) => {
                error!("failed to run job server: {e:#}");
                1
            }
        },
        Err(e) => {
            error!("failed to load configuration from env: {e}");
            1
        }
    };

    std::process::exit(code);
}
