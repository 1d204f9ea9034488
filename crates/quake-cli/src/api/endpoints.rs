//! API endpoint URL builders

/// Build run submission URL
pub fn run_url(base_url: &str) -> String {
    format!("{}/api/jobs/earthquakes-ingestion/run", base_url)
}

/// Build job status URL
pub fn job_status_url(base_url: &str, job_id: &str) -> String {
    format!("{}/api/jobs/{}/status", base_url, urlencoding::encode(job_id))
}

/// Build execution failure URL
pub fn execution_failure_url(base_url: &str, execution_id: i64) -> String {
    format!("{}/api/execution-failures/{}", base_url, execution_id)
}

/// Build health check URL
pub fn health_url(base_url: &str) -> String {
    format!("{}/health", base_url)
}
