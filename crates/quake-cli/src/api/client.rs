//! HTTP API client for the quake server

use crate::api::endpoints;
use crate::error::{CliError, Result};
use quake_common::messages::{ExecutionFailure, JobStatusResponse, RunJobRequest, RunJobResponse};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

// ============================================================================
// API Client Constants
// ============================================================================

/// Default timeout for API requests in seconds.
/// Can be overridden via QUAKE_API_TIMEOUT_SECS environment variable.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;

/// Default server URL when not specified via environment variable.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

/// Error body produced by the server: `{"error": {"message", "status"}}`
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// API client for the quake server
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: String) -> Result<Self> {
        let timeout_secs = std::env::var("QUAKE_API_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_API_TIMEOUT_SECS);

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check server health
    pub async fn health_check(&self) -> Result<bool> {
        let url = endpoints::health_url(&self.base_url);

        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    /// Fail with [`CliError::Unavailable`] unless the server reports healthy
    pub async fn ensure_available(&self) -> Result<()> {
        if self.health_check().await? {
            Ok(())
        } else {
            Err(CliError::Unavailable(self.base_url.clone()))
        }
    }

    /// Ask the server to launch an ingestion run; returns once it is enqueued
    pub async fn submit_run(&self, job_id: &str, data_directory: &str) -> Result<RunJobResponse> {
        let url = endpoints::run_url(&self.base_url);
        let request = RunJobRequest {
            job_id: job_id.to_string(),
            data_directory: data_directory.to_string(),
        };

        debug!(url = %url, job_id, data_directory, "Submitting run request");
        let response = self.client.post(&url).json(&request).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Latest execution of `job_id`, `None` when nothing was recorded yet
    pub async fn job_status(&self, job_id: &str) -> Result<Option<JobStatusResponse>> {
        let url = endpoints::job_status_url(&self.base_url, job_id);

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json().await?))
    }

    /// Exit code and diagnostics of one execution, `None` when it does not exist
    pub async fn execution_failure(&self, execution_id: i64) -> Result<Option<ExecutionFailure>> {
        let url = endpoints::execution_failure_url(&self.base_url, execution_id);

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json().await?))
    }

    /// Turn non-success responses into [`CliError`], keeping the server's message
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|envelope| envelope.error.message)
            .unwrap_or_else(|_| format!("HTTP {}", status));

        if status.is_client_error() {
            Err(CliError::rejected(message))
        } else {
            Err(CliError::api(message))
        }
    }
}
