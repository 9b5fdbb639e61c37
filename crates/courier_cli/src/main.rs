//! Courier CLI
//!
//! Command-line tools for exercising and debugging the Courier sync engine.
//!
//! # Commands
//!
//! - `simulate` - Run the engine against an in-process backend and report
//! - `recovery-log` - Dump the background request recovery log
//! - `version` - Show version information

mod backend;
mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Courier sync engine tools.
#[derive(Parser)]
#[command(name = "courier")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a generated workload against a simulated backend
    Simulate {
        /// Conversations to create
        #[arg(short, long, default_value = "5")]
        conversations: usize,

        /// Messages per conversation
        #[arg(short, long, default_value = "10")]
        messages: usize,

        /// Maximum concurrent requests
        #[arg(long, default_value = "4")]
        max_concurrent: usize,

        /// Probability that the backend answers 503
        #[arg(long, default_value = "0.0")]
        failure_rate: f64,

        /// Mean backend latency in milliseconds
        #[arg(long, default_value = "5")]
        latency_ms: u64,

        /// Seconds to wait for the engine to catch up
        #[arg(long, default_value = "60")]
        timeout_secs: u64,

        /// Record background uploads to this recovery log
        #[arg(long)]
        recovery_log: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump the entries of a recovery log
    RecoveryLog {
        /// Path to the recovery log file
        path: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            conversations,
            messages,
            max_concurrent,
            failure_rate,
            latency_ms,
            timeout_secs,
            recovery_log,
            format,
        } => {
            let options = commands::simulate::SimulateOptions {
                conversations,
                messages_per_conversation: messages,
                max_concurrent,
                failure_rate,
                latency: Duration::from_millis(latency_ms),
                timeout: Duration::from_secs(timeout_secs),
                recovery_log,
            };
            commands::simulate::run(options, &format).await?;
        }
        Commands::RecoveryLog { path, format } => {
            commands::recovery_log::run(&path, &format)?;
        }
        Commands::Version => {
            println!("Courier CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
