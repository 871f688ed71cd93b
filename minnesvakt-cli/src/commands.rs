use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info};

use minnesvakt_config::MinnesvaktConfig;
use minnesvakt_core::ledger::AllocationLedger;
use minnesvakt_telemetry::logging::EventLogger;
use minnesvakt_telemetry::metrics::MetricsRecorder;

use crate::scenarios;

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Optional configuration file (YAML).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Track and release objects and arrays through the general mechanism
    Track,
    /// Walk a fixed-block pool to exhaustion and back
    Pool(PoolArgs),
    /// Fail construction after storage acquisition, on both paths
    Faulty(PoolArgs),
    /// Leak a tracked allocation deliberately and report it
    Leak,
    /// Run every scenario in sequence
    All(PoolArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct PoolArgs {
    /// Block size override in bytes
    #[arg(long)]
    pub block_size: Option<usize>,

    /// Pool size override in bytes
    #[arg(long)]
    pub pool_size: Option<usize>,
}

pub fn run_command(cli: Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    EventLogger::init();
    let metrics = MetricsRecorder::new();

    let config = match &cli.config {
        Some(path) => MinnesvaktConfig::load_from_path(path)?,
        None => MinnesvaktConfig::load()?,
    };
    if !AllocationLedger::init_global(config.ledger.reserve_size) {
        debug!("process-wide ledger was already initialized, keeping it");
    }

    match cli.command {
        Commands::Track => scenarios::run_tracking(&metrics)?,
        Commands::Pool(args) => {
            let (block_size, pool_size) = geometry(&config, &args);
            scenarios::run_pool_walk(block_size, pool_size, &metrics)?;
        }
        Commands::Faulty(args) => {
            let (block_size, pool_size) = geometry(&config, &args);
            scenarios::run_construction_failure(block_size, pool_size, &metrics)?;
        }
        Commands::Leak => scenarios::run_leak_report(&metrics)?,
        Commands::All(args) => {
            let (block_size, pool_size) = geometry(&config, &args);
            scenarios::run_tracking(&metrics)?;
            scenarios::run_pool_walk(block_size, pool_size, &metrics)?;
            scenarios::run_construction_failure(block_size, pool_size, &metrics)?;
            scenarios::run_leak_report(&metrics)?;
        }
    }

    let gathered = metrics.gather_metrics()?;
    info!(metrics = %gathered, "scenario metrics");

    // Statics have no destructor, so the teardown report for the
    // process-wide ledger is emitted here, as the last action.
    let report = AllocationLedger::global().leak_report();
    info!(leaks = report.leak_count(), "shutdown leak report emitted");
    Ok(())
}

fn geometry(config: &MinnesvaktConfig, args: &PoolArgs) -> (usize, usize) {
    (
        args.block_size.unwrap_or(config.pool.block_size),
        args.pool_size.unwrap_or(config.pool.pool_size),
    )
}
