//! Quake CLI Library
//!
//! Operator command line for the earthquake ingestion service.
//!
//! - **Submission**: launch an ingestion run for a data directory (`quake run`)
//! - **Status**: show the latest execution of a job (`quake status`)
//! - **Diagnostics**: show the exit code and per-partition failures (`quake failure`)
//! - **Waiting**: block until a job reaches a terminal state (`quake wait`)

pub mod api;
pub mod commands;
pub mod error;

pub use error::{CliError, Result};

use clap::{Parser, Subcommand};
use std::time::Duration;

/// Quake - distributed earthquake CSV ingestion
#[derive(Parser, Debug)]
#[command(name = "quake")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print raw JSON instead of formatted text
    #[arg(long, global = true)]
    pub json: bool,

    /// Server URL
    #[arg(long, env = "QUAKE_SERVER_URL", default_value = api::client::DEFAULT_SERVER_URL, global = true)]
    pub server_url: String,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit an ingestion run for a data directory
    Run {
        /// Business job id; resubmitting the same id starts a new execution
        job_id: String,

        /// Directory under the server's input root holding the partition files
        data_directory: String,

        /// Block until the new execution finishes
        #[arg(short, long)]
        wait: bool,

        #[command(flatten)]
        polling: PollArgs,
    },

    /// Show the latest execution of a job
    Status {
        job_id: String,
    },

    /// Show exit code and diagnostics of an execution
    Failure {
        execution_id: i64,
    },

    /// Wait until the latest execution of a job is terminal
    Wait {
        job_id: String,

        #[command(flatten)]
        polling: PollArgs,
    },
}

/// Polling knobs shared by `run --wait` and `wait`
#[derive(clap::Args, Debug, Clone, Copy)]
pub struct PollArgs {
    /// Seconds between status checks
    #[arg(long, default_value = "2", value_parser = parse_seconds)]
    pub interval: Duration,

    /// Give up after this many seconds
    #[arg(long, default_value = "600", value_parser = parse_seconds)]
    pub timeout: Duration,
}

fn parse_seconds(value: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    Duration::try_from_secs_f64(secs).map_err(|_| format!("'{}' is not a valid duration", value))
}
