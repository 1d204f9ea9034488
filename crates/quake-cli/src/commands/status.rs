//! `quake status`

use crate::api::ApiClient;
use crate::error::{CliError, Result};

pub async fn run(client: &ApiClient, job_id: &str, json: bool) -> Result<()> {
    client.ensure_available().await?;
    let status = client
        .job_status(job_id)
        .await?
        .ok_or_else(|| CliError::JobNotFound(job_id.to_string()))?;

    if json {
        super::print_json(&status)
    } else {
        super::print_status(&status);
        Ok(())
    }
}
