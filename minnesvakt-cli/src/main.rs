//! ## minnesvakt-cli
//! **Driver scenarios for the allocation subsystem**
//!
//! Exercises tracking, pooling, construction failure, and leak reporting
//! end to end against the process-wide ledger.
//!
//! ### Expectations:
//! - POSIX-compliant argument parsing
//! - Configuration file and environment overrides
//! - Diagnostic stream initialized before any allocation scenario

use clap::Parser;

mod commands;
mod scenarios;

use commands::Cli;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    commands::run_command(cli)
}
