use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use inbox_pilot::config::Config;
use inbox_pilot::pipeline::Coordinator;
use inbox_pilot::process::{ProcessSpec, SingletonLock, Supervisor, SupervisorSettings};
use inbox_pilot::shutdown::Shutdown;
use inbox_pilot::status::StatusReport;
use inbox_pilot::vault::TaskStore;

#[derive(Parser)]
#[command(name = "inbox-pilot", version, about = "Human-approved task pipeline over a directory vault")]
struct Cli {
    /// Config file (default: ./inbox-pilot.toml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the poll-cycle coordinator.
    Coordinator {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
    },
    /// Keep the configured worker processes alive.
    Supervisor,
    /// Print stage counts, quota headroom and running instances.
    Status,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to stderr and to a daily file `<log_dir>/<role>.log.<date>`.
fn init_tracing(log_dir: &Path, role: &str) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{role}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    guard
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Coordinator { once } => run_coordinator(&config, once).await,
        Command::Supervisor => run_supervisor(&config).await,
        Command::Status => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            let report = StatusReport::collect(&config, Utc::now()).await?;
            print!("{report}");
            Ok(())
        }
    }
}

async fn run_coordinator(config: &Config, once: bool) -> anyhow::Result<()> {
    let log_dir = config.paths.logs();
    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
    let _guard = init_tracing(&log_dir, "coordinator");

    let _lock = SingletonLock::acquire(config.paths.coordinator_lock())?;

    TaskStore::new(config.paths.vault()).ensure_layout().await?;
    tokio::fs::create_dir_all(config.paths.workspace()).await?;
    tokio::fs::create_dir_all(config.paths.state()).await?;

    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers();

    let mut coordinator = Coordinator::from_config(config, &shutdown)?;
    if once {
        let report = coordinator.run_cycle(&shutdown).await?;
        info!(
            tasks = report.tasks.len(),
            approvals = report.approvals.len(),
            "Single cycle finished"
        );
    } else {
        coordinator.run(&shutdown).await;
    }
    Ok(())
}

async fn run_supervisor(config: &Config) -> anyhow::Result<()> {
    let log_dir = config.paths.logs();
    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
    let _guard = init_tracing(&log_dir, "supervisor");

    let _lock = SingletonLock::acquire(config.paths.supervisor_lock())?;

    let specs = config
        .supervisor
        .effective_processes()
        .iter()
        .map(|p| ProcessSpec::from_config(p, &config.paths.base_dir))
        .collect::<Result<Vec<_>, _>>()?;
    let mut supervisor = Supervisor::new(specs, SupervisorSettings::from(&config.supervisor), &log_dir)?;

    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers();
    supervisor.run(&shutdown).await;
    Ok(())
}
