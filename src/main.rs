use std::io;
use std::process::ExitCode;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::comed::ComEd;
use crate::domain::ExporterError;
use crate::metrics::Metrics;
use crate::scheduler::{PollScheduler, SchedulerState};
use crate::setup::{Config, Invocation};

mod comed;
mod domain;
mod http;
mod metrics;
mod scheduler;
mod setup;
mod shutdown;

const APP_NAME: &str = "comed_exporter";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    setup::init_logging();

    let config = match setup::load_invocation() {
        Ok(Invocation::Run(config)) => config,
        Ok(Invocation::Help) => {
            print!("{}", Invocation::usage());
            return ExitCode::SUCCESS;
        }
        Ok(Invocation::Version) => {
            println!("{} {}", APP_NAME, env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(name = APP_NAME, "{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), ExporterError> {
    info!(name = APP_NAME, "starting up");

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(shutdown::listen_for_shutdown(trigger));

    let metrics = Metrics::new()?;

    let listener = TcpListener::bind(config.listen_address).await?;
    let mut server = tokio::spawn(http::start_http_server(
        listener,
        metrics.clone(),
        shutdown.clone(),
    ));

    let comed = ComEd::new(
        setup::build_client()?,
        config.endpoint.as_str(),
        metrics.clone(),
    );
    let scheduler = tokio::spawn(
        PollScheduler::new(comed, metrics, config.interval, shutdown.clone()).run(),
    );

    info!(
        api = %config.endpoint,
        schedule = ?config.interval,
        "started"
    );

    tokio::select! {
        _ = shutdown.wait() => {}
        result = &mut server => {
            // The server only returns on its own when serving failed.
            return Err(match result {
                Ok(Ok(())) => ExporterError::Server("stopped unexpectedly".to_string()),
                Ok(Err(e)) => ExporterError::Server(e.to_string()),
                Err(e) => ExporterError::Server(e.to_string()),
            });
        }
    }

    drain(scheduler, server, SHUTDOWN_GRACE).await
}

/// Waits for the scheduler to stop while, independently, the server gets `grace` to finish
/// open requests. A server that outlives the grace period is aborted.
async fn drain(
    scheduler: JoinHandle<SchedulerState>,
    mut server: JoinHandle<io::Result<()>>,
    grace: Duration,
) -> Result<(), ExporterError> {
    let server = async move {
        match tokio::time::timeout(grace, &mut server).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ExporterError::Server(e.to_string())),
            Ok(Err(e)) => Err(ExporterError::Server(e.to_string())),
            Err(_) => {
                server.abort();
                Err(ExporterError::ShutdownTimeout(grace))
            }
        }
    };

    let (scheduler, drained) = tokio::join!(scheduler, server);

    match scheduler {
        Ok(state) => info!(state = ?state, "stopped querying"),
        Err(e) => error!(err = %e, "scheduler task failed"),
    }

    drained
}
