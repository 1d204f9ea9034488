//! Job state tracking
//!
//! Records every execution of a business job id, its lifecycle status and
//! the outcome of each partition. Only the manager writes through this
//! interface; the HTTP surface only reads.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use quake_common::messages::{ExecutionFailure, JobRequest, JobStatus, JobStatusResponse, WorkReply};
use quake_common::QuakeError;
use thiserror::Error;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use super::partition::Partition;

/// Step name used for execution-level diagnostics.
pub const MANAGER_STEP: &str = "managerStep";

/// Prefix of per-partition step names, e.g. "workerStep:partition3".
pub const WORKER_STEP: &str = "workerStep";

/// Exit code reported while an execution is still running.
pub const EXIT_CODE_UNKNOWN: &str = "UNKNOWN";

/// Diagnostic stored on partitions that never reported before a failed finish.
pub const NO_REPLY_DIAGNOSTIC: &str = "no reply received before the step ended";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Execution {0} not found")]
    NotFound(i64),

    #[error("Execution {execution_id} cannot move from {from} to {to}")]
    InvalidTransition {
        execution_id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Execution {execution_id} has no partition '{partition_id}'")]
    UnknownPartition { execution_id: i64, partition_id: String },

    #[error("Stored state is invalid: {0}")]
    Corrupt(#[from] QuakeError),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create an execution in STARTING and return its id
    async fn create_execution(&self, request: &JobRequest) -> Result<i64, TrackerError>;

    /// STARTING -> STARTED, stamping the start time
    async fn mark_started(&self, execution_id: i64) -> Result<(), TrackerError>;

    /// Register the planned partitions of a started execution
    async fn record_partitions(&self, execution_id: i64, partitions: &[Partition]) -> Result<(), TrackerError>;

    /// Store a worker reply. Returns `false` if the partition had already
    /// reported.
    async fn record_reply(&self, execution_id: i64, reply: &WorkReply) -> Result<bool, TrackerError>;

    /// Move the execution to a terminal status
    ///
    /// Partitions that never reported take the same status.
    async fn finish(
        &self,
        execution_id: i64,
        status: JobStatus,
        exit_description: Option<&str>,
    ) -> Result<(), TrackerError>;

    /// Most recent execution of a business job id
    async fn latest_by_job_id(&self, job_id: &str) -> Result<Option<JobStatusResponse>, TrackerError>;

    async fn failure_by_execution(&self, execution_id: i64) -> Result<Option<ExecutionFailure>, TrackerError>;

    async fn ping(&self) -> Result<(), TrackerError>;
}

pub(crate) fn ensure_transition(execution_id: i64, from: JobStatus, to: JobStatus) -> Result<(), TrackerError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(TrackerError::InvalidTransition { execution_id, from, to })
    }
}

/// Status a partition takes for a reply outcome
pub(crate) fn partition_status(reply: &WorkReply) -> JobStatus {
    if reply.is_success() {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    }
}

pub(crate) fn exit_code(status: JobStatus) -> String {
    if status.is_terminal() {
        status.as_str().to_string()
    } else {
        EXIT_CODE_UNKNOWN.to_string()
    }
}

/// One line per failing step: the execution itself, then each failed partition
pub(crate) fn describe_failure(execution_description: Option<&str>, failed: &[(String, Option<String>)]) -> String {
    let mut lines = Vec::with_capacity(failed.len() + 1);

    if let Some(description) = execution_description.filter(|d| !d.is_empty()) {
        lines.push(format!("[{}]: {}", MANAGER_STEP, description));
    }
    for (partition_id, diagnostics) in failed {
        lines.push(format!(
            "[{}:{}]: {}",
            WORKER_STEP,
            partition_id,
            diagnostics.as_deref().unwrap_or(NO_REPLY_DIAGNOSTIC)
        ));
    }

    lines.join("\n")
}
