use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flow_runner::config::Config;
use flow_runner::logging;
use flow_runner::task::CommandTask;
use flow_runner::web;
use flow_runner::worker::Worker;

const DEFAULT_CONFIG_PATH: &str = "/etc/flow-runner/config.yaml";
const BIND_ENV: &str = "FLOW_RUNNER_BIND";

#[derive(Parser, Debug)]
#[command(
    name = "flow-runner",
    version,
    about = "Run one long task at a time, triggered over HTTP."
)]
struct Cli {
    /// Path to YAML configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address for the control surface (overrides bind-address and FLOW_RUNNER_BIND).
    #[arg(long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    /// Log filter directives (overrides RUST_LOG), e.g. `debug` or `flow_runner=trace`.
    #[arg(long, value_name = "DIRECTIVES")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init(cli.log_level.as_deref()) {
        eprintln!("flow-runner: {err:#}");
        std::process::exit(2);
    }
    if let Err(err) = try_main(cli).await {
        error!(error = ?err, "flow-runner exited with error");
        std::process::exit(1);
    }
}

async fn try_main(cli: Cli) -> Result<()> {
    let env_bind = env::var(BIND_ENV).ok();
    let config = Config::resolve(
        cli.config.as_deref(),
        Path::new(DEFAULT_CONFIG_PATH),
        env_bind.as_deref(),
        cli.bind,
    )?
    .validated()
    .context("invalid configuration values")?;

    let task = CommandTask::from_config(&config.task).context("building task command")?;
    info!(
        program = task.program(),
        bind_address = %config.bind_address,
        poll_interval = ?config.poll_interval,
        "starting flow-runner"
    );

    // The worker must be running before any request can reach it.
    let worker = Worker::spawn(task, config.worker_options())?;

    let listener = TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("failed to bind control surface on {}", config.bind_address))?;

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    let served = web::serve(listener, worker.clone(), cancel).await;

    worker.request_exit();
    if worker.is_running() {
        info!(grace = ?config.shutdown_grace, "waiting for the in-flight run to finish");
    }
    match worker.wait_stopped(config.shutdown_grace).await {
        Ok(true) => info!("worker stopped"),
        Ok(false) => warn!(
            grace = ?config.shutdown_grace,
            "worker still busy after shutdown grace; exiting anyway"
        ),
        Err(err) => warn!(error = ?err, "worker stopped abnormally"),
    }
    served
}

async fn watch_signals(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {err}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                warn!("failed to register SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received; shutting down"),
        _ = terminate => info!("SIGTERM received; shutting down"),
    }
    cancel.cancel();
}
