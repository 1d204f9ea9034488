//! Get status query
//!
//! Latest execution of a business job id.

use quake_common::messages::JobStatusResponse;
use serde::{Deserialize, Serialize};

use crate::ingest::{JobStore, TrackerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStatusQuery {
    pub job_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GetStatusError {
    #[error("No execution found for job '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

pub async fn handle(tracker: &dyn JobStore, query: GetStatusQuery) -> Result<JobStatusResponse, GetStatusError> {
    tracker
        .latest_by_job_id(&query.job_id)
        .await?
        .ok_or(GetStatusError::NotFound(query.job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::MemoryJobStore;
    use quake_common::messages::{JobRequest, JobStatus};

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let store = MemoryJobStore::new();
        let result = handle(&store, GetStatusQuery { job_id: "missing".into() }).await;
        assert!(matches!(result, Err(GetStatusError::NotFound(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn test_returns_latest_execution() {
        let store = MemoryJobStore::new();
        let request = JobRequest::earthquake_ingestion("nightly", "2024");
        store.create_execution(&request).await.unwrap();
        let latest = store.create_execution(&request).await.unwrap();

        let status = handle(&store, GetStatusQuery { job_id: "nightly".into() }).await.unwrap();
        assert_eq!(status.execution_id, latest);
        assert_eq!(status.status, JobStatus::Starting);
        assert!(status.start_time.is_none());
    }
}
