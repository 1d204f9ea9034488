//! Quake CLI - Main entry point

use clap::Parser;
use quake_cli::{api::ApiClient, Cli, Commands};
use quake_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Verbose mode logs debug to the console, otherwise warnings only
    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Warn })
        .output(LogOutput::Console)
        .log_file_prefix("quake-cli")
        .build();
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // The CLI works without logging
    let _guard = init_logging(&log_config).ok();

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> quake_cli::Result<()> {
    let client = ApiClient::new(cli.server_url.clone())?;

    match &cli.command {
        Commands::Run {
            job_id,
            data_directory,
            wait,
            polling,
        } => quake_cli::commands::run::run(&client, job_id, data_directory, *wait, *polling, cli.json).await,

        Commands::Status { job_id } => quake_cli::commands::status::run(&client, job_id, cli.json).await,

        Commands::Failure { execution_id } => {
            quake_cli::commands::failure::run(&client, *execution_id, cli.json).await
        }

        Commands::Wait { job_id, polling } => {
            quake_cli::commands::wait::run(&client, job_id, *polling, cli.json).await
        }
    }
}
