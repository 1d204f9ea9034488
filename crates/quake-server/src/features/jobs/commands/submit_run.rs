//! Submit run command
//!
//! Validates a run request and publishes it on the job-requests queue. The
//! manager picks it up asynchronously.

use quake_common::messages::{JobRequest, RunJobRequest, RunJobResponse};
use serde::{Deserialize, Serialize};

use crate::broker::{publish_json, BrokerError, MessageBroker};
use crate::ingest::partition::validate_data_directory;

pub const SUBMITTED_MESSAGE: &str = "run request submitted";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRunCommand {
    pub job_id: String,
    pub data_directory: String,
}

impl From<RunJobRequest> for SubmitRunCommand {
    fn from(request: RunJobRequest) -> Self {
        Self {
            job_id: request.job_id,
            data_directory: request.data_directory,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitRunError {
    #[error("{0}")]
    Validation(String),

    #[error("Failed to enqueue run request: {0}")]
    Broker(#[from] BrokerError),
}

impl SubmitRunCommand {
    pub fn validate(&self) -> Result<(), SubmitRunError> {
        if self.job_id.trim().is_empty() {
            return Err(SubmitRunError::Validation("jobId is required".to_string()));
        }
        if self.data_directory.trim().is_empty() {
            return Err(SubmitRunError::Validation("dataDirectory is required".to_string()));
        }
        validate_data_directory(self.data_directory.trim())
            .map_err(|e| SubmitRunError::Validation(e.to_string()))?;
        Ok(())
    }
}

#[tracing::instrument(skip(broker, command), fields(job_id = %command.job_id))]
pub async fn handle(
    broker: &dyn MessageBroker,
    queue: &str,
    command: SubmitRunCommand,
) -> Result<RunJobResponse, SubmitRunError> {
    command.validate()?;

    let request = JobRequest::earthquake_ingestion(command.job_id.trim(), command.data_directory.trim());
    publish_json(broker, queue, &request).await?;
    tracing::info!(data_directory = %request.data_directory, "Run request submitted");

    Ok(RunJobResponse {
        job_id: request.job_id,
        message: SUBMITTED_MESSAGE.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerSettings, InMemoryBroker};
    use std::time::Duration;

    fn command(job_id: &str, data_directory: &str) -> SubmitRunCommand {
        SubmitRunCommand {
            job_id: job_id.to_string(),
            data_directory: data_directory.to_string(),
        }
    }

    #[test]
    fn test_validation() {
        assert!(command("nightly", "2024/01").validate().is_ok());
        assert!(command(" ", "2024").validate().is_err());
        assert!(command("nightly", "").validate().is_err());
        assert!(command("nightly", "/etc").validate().is_err());
        assert!(command("nightly", "../up").validate().is_err());
    }

    #[tokio::test]
    async fn test_handle_enqueues_job_request() {
        let broker = InMemoryBroker::new(BrokerSettings::default());

        let response = handle(&broker, "requests", command("nightly", "2024")).await.unwrap();
        assert_eq!(response.job_id, "nightly");
        assert_eq!(response.message, SUBMITTED_MESSAGE);

        let delivery = broker
            .receive("requests", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let request: JobRequest = delivery.decode().unwrap();
        assert_eq!(request, JobRequest::earthquake_ingestion("nightly", "2024"));
    }

    #[tokio::test]
    async fn test_invalid_command_is_not_enqueued() {
        let broker = InMemoryBroker::new(BrokerSettings::default());
        assert!(matches!(
            handle(&broker, "requests", command("", "2024")).await,
            Err(SubmitRunError::Validation(_))
        ));
        assert_eq!(broker.pending("requests").await, 0);
    }
}
