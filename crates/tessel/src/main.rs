use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tessel_coordinator::{Coordinator, QueryEncoding, Settings as CoordinatorSettings};
use tessel_engine::fabric::GrpcFabricBuilder;
use tessel_engine::MemoryStorage;
use tessel_worker::{Settings as WorkerSettings, Worker};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tessel distributed query engine", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker; its catalog is read from the working directory.
    Worker {
        #[arg(short, long, default_value = ".")]
        working_dir: PathBuf,
    },
    /// Run the coordinator.
    Coordinator {
        #[arg(short, long)]
        config: Option<String>,
        /// Submit this JSON query, print its outcome and stop.
        #[arg(short, long)]
        query: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let code = match args.command {
        Command::Worker { working_dir } => run_worker(&working_dir).await,
        Command::Coordinator { config, query } => run_coordinator(config, query).await,
    };
    match code {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(3);
        }
    }
}

async fn run_worker(working_dir: &Path) -> Result<i32> {
    let settings = WorkerSettings::from_working_dir(working_dir)
        .with_context(|| format!("reading the worker catalog in {}", working_dir.display()))?;
    let builder = GrpcFabricBuilder {
        listen: settings.listen_socket()?,
        peers: Vec::new(),
        flow: settings.flow,
        connect_timeout: settings.connect_timeout(),
    };
    let handle = Worker::start(settings, &builder, Arc::new(MemoryStorage::new())).await?;
    let termination = tokio::select! {
        termination = handle.terminated() => termination,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            handle.shutdown().await
        }
    };
    info!(cause = ?termination.cause, stuck = ?termination.stuck_tasks, "worker exited");
    Ok(termination.exit_code())
}

async fn run_coordinator(config: Option<String>, query: Option<PathBuf>) -> Result<i32> {
    let settings = match config {
        Some(path) => CoordinatorSettings::from_path(&path),
        None => CoordinatorSettings::new(),
    }
    .context("reading coordinator settings")?;
    let builder = GrpcFabricBuilder {
        listen: settings.server_address()?,
        peers: Vec::new(),
        flow: settings.flow,
        connect_timeout: settings.connect_timeout(),
    };
    let catalog = Arc::new(settings.catalog());
    let coordinator = Coordinator::start(settings, &builder, catalog).await?;

    let code = match query {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading query {}", path.display()))?;
            let encoding: QueryEncoding = serde_json::from_str(&text).context("parsing query")?;
            let query_id = coordinator.submit(encoding)?;
            let outcome = coordinator.wait(query_id).await?;
            println!(
                "query {} {:?}: {} tuples on {} workers",
                outcome.query_id,
                outcome.status,
                outcome.tuples_produced(),
                outcome.stats.len()
            );
            if outcome.succeeded() { 0 } else { 1 }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("interrupted, stopping workers");
            coordinator.shutdown_workers();
            0
        }
    };
    coordinator.shutdown();
    Ok(code)
}
