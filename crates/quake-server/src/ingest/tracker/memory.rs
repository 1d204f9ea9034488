//! In-memory job store for `standalone` runs and tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quake_common::messages::{
    ExecutionFailure, JobRequest, JobStatus, JobStatusResponse, PartitionCounts, WorkReply,
};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

use super::{
    describe_failure, ensure_transition, exit_code, partition_status, JobStore, TrackerError,
    NO_REPLY_DIAGNOSTIC,
};
use crate::ingest::partition::Partition;

#[derive(Debug, Clone)]
struct PartitionEntry {
    id: String,
    status: JobStatus,
    worker_identity: Option<String>,
    counts: PartitionCounts,
    diagnostics: Option<String>,
}

#[derive(Debug, Clone)]
struct ExecutionEntry {
    job_id: String,
    status: JobStatus,
    exit_description: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    /// Kept in plan order
    partitions: Vec<PartitionEntry>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    executions: BTreeMap<i64, ExecutionEntry>,
}

impl State {
    fn execution(&mut self, execution_id: i64) -> Result<&mut ExecutionEntry, TrackerError> {
        self.executions
            .get_mut(&execution_id)
            .ok_or(TrackerError::NotFound(execution_id))
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: RwLock<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts reported for one partition, if it has reported
    pub async fn partition_counts(&self, execution_id: i64, partition_id: &str) -> Option<PartitionCounts> {
        let state = self.state.read().await;
        state
            .executions
            .get(&execution_id)?
            .partitions
            .iter()
            .find(|p| p.id == partition_id && p.status.is_terminal())
            .map(|p| p.counts)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_execution(&self, request: &JobRequest) -> Result<i64, TrackerError> {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let execution_id = state.next_id;
        state.executions.insert(
            execution_id,
            ExecutionEntry {
                job_id: request.job_id.clone(),
                status: JobStatus::Starting,
                exit_description: None,
                start_time: None,
                end_time: None,
                partitions: Vec::new(),
            },
        );
        Ok(execution_id)
    }

    async fn mark_started(&self, execution_id: i64) -> Result<(), TrackerError> {
        let mut state = self.state.write().await;
        let execution = state.execution(execution_id)?;
        ensure_transition(execution_id, execution.status, JobStatus::Started)?;
        execution.status = JobStatus::Started;
        execution.start_time = Some(Utc::now());
        Ok(())
    }

    async fn record_partitions(&self, execution_id: i64, partitions: &[Partition]) -> Result<(), TrackerError> {
        let mut state = self.state.write().await;
        let execution = state.execution(execution_id)?;
        if execution.status != JobStatus::Started {
            return Err(TrackerError::InvalidTransition {
                execution_id,
                from: execution.status,
                to: JobStatus::Started,
            });
        }

        let mut sorted: Vec<&Partition> = partitions.iter().collect();
        sorted.sort_by_key(|p| p.ordinal);
        execution.partitions = sorted
            .into_iter()
            .map(|p| PartitionEntry {
                id: p.id.clone(),
                status: JobStatus::Started,
                worker_identity: None,
                counts: PartitionCounts::default(),
                diagnostics: None,
            })
            .collect();
        Ok(())
    }

    async fn record_reply(&self, execution_id: i64, reply: &WorkReply) -> Result<bool, TrackerError> {
        let mut state = self.state.write().await;
        let execution = state.execution(execution_id)?;
        let running = execution.status;

        let partition = execution
            .partitions
            .iter_mut()
            .find(|p| p.id == reply.partition_id)
            .ok_or_else(|| TrackerError::UnknownPartition {
                execution_id,
                partition_id: reply.partition_id.clone(),
            })?;

        if partition.status.is_terminal() || running != JobStatus::Started {
            return Ok(false);
        }

        partition.status = partition_status(reply);
        partition.worker_identity = Some(reply.worker_identity.clone());
        partition.counts = reply.counts;
        partition.diagnostics = reply.diagnostics.clone();
        Ok(true)
    }

    async fn finish(
        &self,
        execution_id: i64,
        status: JobStatus,
        exit_description: Option<&str>,
    ) -> Result<(), TrackerError> {
        let mut state = self.state.write().await;
        let execution = state.execution(execution_id)?;
        ensure_transition(execution_id, execution.status, status)?;

        execution.status = status;
        execution.exit_description = exit_description.map(str::to_string);
        execution.end_time = Some(Utc::now());

        for partition in execution.partitions.iter_mut().filter(|p| !p.status.is_terminal()) {
            partition.status = status;
            if status == JobStatus::Failed && partition.diagnostics.is_none() {
                partition.diagnostics = Some(NO_REPLY_DIAGNOSTIC.to_string());
            }
        }
        Ok(())
    }

    async fn latest_by_job_id(&self, job_id: &str) -> Result<Option<JobStatusResponse>, TrackerError> {
        let state = self.state.read().await;
        let latest = state
            .executions
            .iter()
            .rev()
            .find(|(_, e)| e.job_id == job_id);

        Ok(latest.map(|(execution_id, execution)| {
            let workers: HashSet<&str> = execution
                .partitions
                .iter()
                .filter_map(|p| p.worker_identity.as_deref())
                .collect();

            JobStatusResponse {
                job_id: execution.job_id.clone(),
                execution_id: *execution_id,
                status: execution.status,
                start_time: execution.start_time,
                end_time: execution.end_time,
                worker_count: workers.len() as i64,
            }
        }))
    }

    async fn failure_by_execution(&self, execution_id: i64) -> Result<Option<ExecutionFailure>, TrackerError> {
        let state = self.state.read().await;
        let Some(execution) = state.executions.get(&execution_id) else {
            return Ok(None);
        };

        let failed: Vec<(String, Option<String>)> = execution
            .partitions
            .iter()
            .filter(|p| p.status == JobStatus::Failed)
            .map(|p| (p.id.clone(), p.diagnostics.clone()))
            .collect();

        Ok(Some(ExecutionFailure {
            exit_code: exit_code(execution.status),
            exit_description: describe_failure(execution.exit_description.as_deref(), &failed),
        }))
    }

    async fn ping(&self) -> Result<(), TrackerError> {
        Ok(())
    }
}
