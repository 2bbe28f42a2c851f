mod broadcast;
mod cache;
mod config;
mod errors;
mod metrics;
mod middleware;
mod models;
mod optimize;
mod routes;
mod scorer;
mod shutdown;
mod state;
mod supervisor;
mod worker;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::shutdown::shutdown_signal;
use crate::supervisor::{Supervisor, WorkerCommand};

/// ATS resume-optimization relay.
#[derive(Debug, Parser)]
#[command(name = "ats-relay", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start and supervise the worker processes (default).
    Supervise {
        /// Override the worker count (default: 1 in local mode, one per CPU core otherwise).
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Run a single worker process in the foreground.
    Worker,
}

// Each process, supervisor or worker, is single-threaded; scaling comes from
// running more worker processes.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration first (fails on malformed env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("ats_relay={},tower_http={}", config.rust_log, config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command.unwrap_or(Command::Supervise { workers: None }) {
        Command::Supervise { workers } => {
            info!(
                "Starting ATS relay v{} in {} environment",
                env!("CARGO_PKG_VERSION"),
                config.environment
            );
            let workers = workers.unwrap_or_else(|| config.worker_count());
            let supervisor = Supervisor::new(WorkerCommand::current_exe()?, workers);
            let report = supervisor.run(shutdown_signal()).await?;
            info!(
                "Supervisor exited after {} worker restarts",
                report.restarts
            );
        }
        Command::Worker => worker::run(config).await?,
    }

    Ok(())
}
