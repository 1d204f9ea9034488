//! Get failure query
//!
//! Exit code and aggregated diagnostics of one execution.

use quake_common::messages::ExecutionFailure;
use serde::{Deserialize, Serialize};

use crate::ingest::{JobStore, TrackerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFailureQuery {
    pub execution_id: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum GetFailureError {
    #[error("Execution {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

pub async fn handle(tracker: &dyn JobStore, query: GetFailureQuery) -> Result<ExecutionFailure, GetFailureError> {
    tracker
        .failure_by_execution(query.execution_id)
        .await?
        .ok_or(GetFailureError::NotFound(query.execution_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::MemoryJobStore;
    use quake_common::messages::{JobRequest, JobStatus};

    #[tokio::test]
    async fn test_unknown_execution_is_not_found() {
        let store = MemoryJobStore::new();
        let result = handle(&store, GetFailureQuery { execution_id: 42 }).await;
        assert!(matches!(result, Err(GetFailureError::NotFound(42))));
    }

    #[tokio::test]
    async fn test_running_execution_has_unknown_exit_code() {
        let store = MemoryJobStore::new();
        let id = store
            .create_execution(&JobRequest::earthquake_ingestion("nightly", "2024"))
            .await
            .unwrap();
        store.mark_started(id).await.unwrap();

        let failure = handle(&store, GetFailureQuery { execution_id: id }).await.unwrap();
        assert_eq!(failure.exit_code, "UNKNOWN");
        assert_eq!(failure.exit_description, "");

        store.finish(id, JobStatus::Failed, Some("planning failed")).await.unwrap();
        let failure = handle(&store, GetFailureQuery { execution_id: id }).await.unwrap();
        assert_eq!(failure.exit_code, "FAILED");
        assert_eq!(failure.exit_description, "[managerStep]: planning failed");
    }
}
