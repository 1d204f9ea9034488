//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod failure;
pub mod run;
pub mod status;
pub mod wait;

use chrono::{DateTime, Utc};
use colored::Colorize;
use quake_common::messages::{ExecutionFailure, JobStatus, JobStatusResponse};
use serde::Serialize;

use crate::error::Result;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn colored_status(status: JobStatus) -> colored::ColoredString {
    match status {
        JobStatus::Completed => status.as_str().green().bold(),
        JobStatus::Failed => status.as_str().red().bold(),
        JobStatus::Stopped => status.as_str().yellow().bold(),
        JobStatus::Starting | JobStatus::Started => status.as_str().cyan(),
    }
}

fn timestamp(value: Option<DateTime<Utc>>) -> String {
    value.map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
}

pub(crate) fn print_status(status: &JobStatusResponse) {
    println!("Job:        {}", status.job_id);
    println!("Execution:  {}", status.execution_id);
    println!("Status:     {}", colored_status(status.status));
    println!("Started:    {}", timestamp(status.start_time));
    println!("Ended:      {}", timestamp(status.end_time));
    println!("Workers:    {}", status.worker_count);
}

pub(crate) fn print_failure(failure: &ExecutionFailure) {
    println!("Exit code:  {}", failure.exit_code);
    if failure.exit_description.is_empty() {
        return;
    }
    println!("{}", "Diagnostics:".bold());
    for line in failure.exit_description.lines() {
        println!("  {}", line);
    }
}
