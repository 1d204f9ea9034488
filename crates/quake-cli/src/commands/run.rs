//! `quake run`

use colored::Colorize;

use crate::api::ApiClient;
use crate::error::Result;
use crate::PollArgs;

pub async fn run(
    client: &ApiClient,
    job_id: &str,
    data_directory: &str,
    wait: bool,
    polling: PollArgs,
    json: bool,
) -> Result<()> {
    // Remember the current execution so --wait ignores it
    let previous = if wait {
        client.ensure_available().await?;
        client.job_status(job_id).await?.map(|s| s.execution_id)
    } else {
        None
    };

    let response = client.submit_run(job_id, data_directory).await?;
    if json && !wait {
        return super::print_json(&response);
    }
    if !json {
        println!("{} {}: {}", "✓".green(), response.job_id, response.message);
    }

    if wait {
        let status = super::wait::wait_for_terminal(client, job_id, previous, polling).await?;
        super::wait::report(client, &status, json).await?;
    }
    Ok(())
}
