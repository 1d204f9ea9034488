//! Messages exchanged between the submission API, the manager and workers
//!
//! All payloads travel as camelCase JSON. Only these immutable values cross
//! process boundaries; the manager and workers keep their own state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QuakeError;

/// Job type accepted by the earthquake ingestion manager
pub const EARTHQUAKE_INGESTION_JOB: &str = "earthquake-ingestion-job";

/// Request to launch a job, published on the job-requests queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub job_id: String,
    pub job_type: String,
    pub data_directory: String,
}

impl JobRequest {
    pub fn earthquake_ingestion(job_id: impl Into<String>, data_directory: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: EARTHQUAKE_INGESTION_JOB.to_string(),
            data_directory: data_directory.into(),
        }
    }
}

/// One partition handed from the manager to any idle worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkAssignment {
    pub execution_id: i64,
    pub job_id: String,
    pub partition_id: String,
    pub source_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionOutcome {
    Succeeded,
    Failed,
}

/// Row counters reported for a partition
///
/// On failure `read == written + skipped`: rows of a rolled-back chunk count
/// as skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCounts {
    pub read: u64,
    pub processed: u64,
    pub written: u64,
    pub skipped: u64,
}

/// Worker's answer for one assignment, published on the worker-replies queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkReply {
    pub execution_id: i64,
    pub partition_id: String,
    pub outcome: PartitionOutcome,
    pub counts: PartitionCounts,
    pub worker_identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl WorkReply {
    pub fn succeeded(assignment: &WorkAssignment, counts: PartitionCounts, worker: &str) -> Self {
        Self {
            execution_id: assignment.execution_id,
            partition_id: assignment.partition_id.clone(),
            outcome: PartitionOutcome::Succeeded,
            counts,
            worker_identity: worker.to_string(),
            diagnostics: None,
        }
    }

    pub fn failed(
        assignment: &WorkAssignment,
        counts: PartitionCounts,
        worker: &str,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: assignment.execution_id,
            partition_id: assignment.partition_id.clone(),
            outcome: PartitionOutcome::Failed,
            counts,
            worker_identity: worker.to_string(),
            diagnostics: Some(diagnostics.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == PartitionOutcome::Succeeded
    }
}

/// Lifecycle of a job execution and of each of its partitions
///
/// `STARTING -> STARTED -> {COMPLETED | FAILED | STOPPED}`, plus
/// `STARTING -> FAILED` when the launch itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Starting,
    Started,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Starting => "STARTING",
            JobStatus::Started => "STARTED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Starting, Started) | (Starting, Failed) | (Started, Completed) | (Started, Failed) | (Started, Stopped)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = QuakeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(JobStatus::Starting),
            "STARTED" => Ok(JobStatus::Started),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "STOPPED" => Ok(JobStatus::Stopped),
            other => Err(QuakeError::UnknownStatus(other.to_string())),
        }
    }
}

// ============================================================================
// HTTP bodies
// ============================================================================

/// Body of `POST /api/jobs/earthquakes-ingestion/run`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJobRequest {
    pub job_id: String,
    pub data_directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJobResponse {
    pub job_id: String,
    pub message: String,
}

/// Latest execution of a business job id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: String,
    pub execution_id: i64,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub worker_count: i64,
}

/// Exit code and aggregated diagnostics of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFailure {
    pub exit_code: String,
    pub exit_description: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assignment() -> WorkAssignment {
        WorkAssignment {
            execution_id: 7,
            job_id: "nightly".to_string(),
            partition_id: "partition2".to_string(),
            source_path: "/data/2024/earthquakes-3.csv".to_string(),
        }
    }

    #[test]
    fn test_assignment_wire_format() {
        let value = serde_json::to_value(assignment()).unwrap();
        assert_eq!(
            value,
            json!({
                "executionId": 7,
                "jobId": "nightly",
                "partitionId": "partition2",
                "sourcePath": "/data/2024/earthquakes-3.csv"
            })
        );
    }

    #[test]
    fn test_reply_omits_diagnostics_on_success() {
        let reply = WorkReply::succeeded(&assignment(), PartitionCounts::default(), "host-a");
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["outcome"], "SUCCEEDED");
        assert!(value.get("diagnostics").is_none());

        let failed = WorkReply::failed(&assignment(), PartitionCounts::default(), "host-a", "boom");
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["outcome"], "FAILED");
        assert_eq!(value["diagnostics"], "boom");
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Starting.can_transition_to(JobStatus::Started));
        assert!(JobStatus::Starting.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Started.can_transition_to(JobStatus::Stopped));
        assert!(!JobStatus::Starting.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Started));

        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Stopped] {
            assert!(status.is_terminal());
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_response_is_camel_case() {
        let body = JobStatusResponse {
            job_id: "nightly".to_string(),
            execution_id: 3,
            status: JobStatus::Completed,
            start_time: None,
            end_time: None,
            worker_count: 2,
        };
        let value = serde_json::to_value(body).unwrap();
        assert_eq!(value["executionId"], 3);
        assert_eq!(value["workerCount"], 2);
        assert_eq!(value["status"], "COMPLETED");
    }
}
