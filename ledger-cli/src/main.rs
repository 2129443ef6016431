//! Ledger Engine Command Line Interface
//!
//! Usage:
//!   ledger run                - Start every job and run until Ctrl-C
//!   ledger trigger <job>      - Run one job once through its guard
//!   ledger init-schema        - Create the PostgreSQL schema
//!   ledger jobs               - List jobs and their schedules

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// Use the in-memory store instead of PostgreSQL
pub const MEMORY_URL: &str = "mem://";

#[derive(Parser)]
#[command(name = "ledger")]
#[command(about = "Ledger scheduling and reconciliation engine")]
#[command(version)]
pub struct Cli {
    /// PostgreSQL URL, or mem:// for an in-memory store
    #[arg(long, env = "LEDGER_DATABASE_URL", default_value = MEMORY_URL)]
    pub database_url: String,

    /// Use development defaults instead of LEDGER_* environment settings
    #[arg(long)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start every job timer and the referral worker
    Run,

    /// Run one job immediately
    Trigger {
        /// Job name, e.g. payment_scan or roi-payout
        job: String,
    },

    /// Create the ledger schema
    InitSchema,

    /// List jobs and their intervals
    Jobs,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ledger_engine=info,ledger_cli=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = commands::run_command(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
