//! `quake wait`
//!
//! Polls the status endpoint until the latest execution is terminal. A job
//! that is not recorded yet is treated as pending, since submission only
//! enqueues the request. An unreachable server fails up front instead of
//! being polled until the timeout.

use quake_common::messages::{JobStatus, JobStatusResponse};
use serde_json::json;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::api::ApiClient;
use crate::error::{CliError, Result};
use crate::PollArgs;

pub async fn run(client: &ApiClient, job_id: &str, polling: PollArgs, json: bool) -> Result<()> {
    client.ensure_available().await?;
    let status = wait_for_terminal(client, job_id, None, polling).await?;
    report(client, &status, json).await
}

/// Poll until an execution newer than `after` reaches a terminal state
pub async fn wait_for_terminal(
    client: &ApiClient,
    job_id: &str,
    after: Option<i64>,
    polling: PollArgs,
) -> Result<JobStatusResponse> {
    let started = Instant::now();
    let deadline = started + polling.timeout;

    loop {
        match client.job_status(job_id).await? {
            Some(status) if after.is_some_and(|previous| status.execution_id <= previous) => {
                debug!(job_id, execution_id = status.execution_id, "New execution not recorded yet");
            }
            Some(status) if status.status.is_terminal() => return Ok(status),
            Some(status) => {
                debug!(job_id, execution_id = status.execution_id, status = %status.status, "Still running");
            }
            None => debug!(job_id, "Job not recorded yet"),
        }

        if Instant::now() >= deadline {
            return Err(CliError::WaitTimeout {
                job_id: job_id.to_string(),
                waited_secs: started.elapsed().as_secs(),
            });
        }
        sleep(polling.interval).await;
    }
}

/// Print a terminal execution, adding its diagnostics when it did not complete
pub async fn report(client: &ApiClient, status: &JobStatusResponse, json: bool) -> Result<()> {
    let failure = if status.status == JobStatus::Completed {
        None
    } else {
        client.execution_failure(status.execution_id).await?
    };

    if json {
        super::print_json(&json!({ "status": status, "failure": failure }))?;
    } else {
        super::print_status(status);
        if let Some(failure) = &failure {
            super::print_failure(failure);
        }
    }

    if status.status == JobStatus::Completed {
        Ok(())
    } else {
        Err(CliError::JobFailed {
            job_id: status.job_id.clone(),
            execution_id: status.execution_id,
            status: status.status,
        })
    }
}
