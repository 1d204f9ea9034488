//! `quake failure`

use crate::api::ApiClient;
use crate::error::{CliError, Result};

pub async fn run(client: &ApiClient, execution_id: i64, json: bool) -> Result<()> {
    let failure = client
        .execution_failure(execution_id)
        .await?
        .ok_or(CliError::ExecutionNotFound(execution_id))?;

    if json {
        super::print_json(&failure)
    } else {
        super::print_failure(&failure);
        Ok(())
    }
}
