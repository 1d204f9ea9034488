//! Error types for the quake CLI
//!
//! Every variant is user-facing, so messages say what went wrong and what to
//! try next.

use quake_common::messages::JobStatus;
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// The API answered with a server-side error
    #[error("Server error: {0}. Ensure the quake API is running and reachable via --server-url.")]
    Api(String),

    /// The API refused the request as invalid
    #[error("Request rejected: {0}. Job id and data directory must be non-blank, and the directory must be relative without '..'.")]
    Rejected(String),

    /// `/health` did not answer, or reported the broker or database down
    #[error("Quake server at {0} is not available. Start it or point --server-url at a running instance.")]
    Unavailable(String),

    #[error("No execution found for job '{0}'. Submit it first with 'quake run {0} <DATA_DIRECTORY>'.")]
    JobNotFound(String),

    #[error("Execution {0} not found. Check the id reported by 'quake status'.")]
    ExecutionNotFound(i64),

    /// A waited-on execution ended in anything but COMPLETED
    #[error("Job '{job_id}' execution {execution_id} finished with status {status}. Run 'quake failure {execution_id}' for details.")]
    JobFailed {
        job_id: String,
        execution_id: i64,
        status: JobStatus,
    },

    #[error("Job '{job_id}' did not finish within {waited_secs}s. Raise --timeout or check that workers are running.")]
    WaitTimeout { job_id: String, waited_secs: u64 },

    /// HTTP request failed
    #[error("Network request failed: {0}. Check your connection and server URL.")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_point_at_next_step() {
        let err = CliError::JobNotFound("nightly".into());
        assert!(err.to_string().contains("quake run nightly"));

        let err = CliError::JobFailed {
            job_id: "nightly".into(),
            execution_id: 42,
            status: JobStatus::Failed,
        };
        assert_eq!(
            err.to_string(),
            "Job 'nightly' execution 42 finished with status FAILED. Run 'quake failure 42' for details."
        );
    }
}
