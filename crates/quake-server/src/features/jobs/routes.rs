//! Job routes

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{get, post},
    Json, Router,
};
use quake_common::messages::{ExecutionFailure, JobStatusResponse, RunJobRequest, RunJobResponse};

use super::commands::{submit_run, SubmitRunError};
use super::queries::{get_failure, get_status, GetFailureError, GetFailureQuery, GetStatusError, GetStatusQuery};
use crate::error::AppError;
use crate::features::ApiState;

pub fn jobs_routes() -> Router<ApiState> {
    Router::new()
        .route("/jobs/earthquakes-ingestion/run", post(submit_run))
        .route("/jobs/:job_id/status", get(get_job_status))
        .route("/execution-failures/:execution_id", get(get_execution_failure))
}

/// POST /jobs/earthquakes-ingestion/run
async fn submit_run(
    State(state): State<ApiState>,
    body: Result<Json<RunJobRequest>, JsonRejection>,
) -> Result<Json<RunJobResponse>, AppError> {
    let Json(request) = body.map_err(|e| AppError::Validation(e.body_text()))?;

    submit_run::handle(state.broker.as_ref(), &state.queues.job_requests, request.into())
        .await
        .map(Json)
        .map_err(|e| match e {
            SubmitRunError::Validation(message) => AppError::Validation(message),
            SubmitRunError::Broker(e) => e.into(),
        })
}

/// GET /jobs/:job_id/status
async fn get_job_status(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    get_status::handle(state.tracker.as_ref(), GetStatusQuery { job_id })
        .await
        .map(Json)
        .map_err(|e| match e {
            GetStatusError::NotFound(_) => AppError::NotFound(e.to_string()),
            GetStatusError::Tracker(e) => e.into(),
        })
}

/// GET /execution-failures/:execution_id
async fn get_execution_failure(
    State(state): State<ApiState>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionFailure>, AppError> {
    let execution_id: i64 = execution_id
        .parse()
        .map_err(|_| AppError::Validation(format!("Invalid execution id '{}'", execution_id)))?;

    get_failure::handle(state.tracker.as_ref(), GetFailureQuery { execution_id })
        .await
        .map(Json)
        .map_err(|e| match e {
            GetFailureError::NotFound(_) => AppError::NotFound(e.to_string()),
            GetFailureError::Tracker(e) => e.into(),
        })
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use quake_common::messages::{JobRequest, JobStatus};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::broker::{BrokerSettings, InMemoryBroker, MessageBroker, QueueNames};
    use crate::features::{router, ApiState};
    use crate::ingest::{JobStore, MemoryJobStore};

    struct TestApp {
        app: Router,
        broker: Arc<InMemoryBroker>,
        tracker: Arc<MemoryJobStore>,
    }

    fn test_app() -> TestApp {
        let broker = Arc::new(InMemoryBroker::new(BrokerSettings::default()));
        let tracker = Arc::new(MemoryJobStore::new());
        let app = router(ApiState {
            broker: broker.clone(),
            queues: QueueNames::default(),
            tracker: tracker.clone(),
        });
        TestApp { app, broker, tracker }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_run(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/jobs/earthquakes-ingestion/run")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_run_submission_is_acknowledged_and_enqueued() {
        let t = test_app();

        let response = t
            .app
            .oneshot(post_run(json!({"jobId": "nightly", "dataDirectory": "2024"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"jobId": "nightly", "message": "run request submitted"})
        );

        let delivery = t
            .broker
            .receive(&QueueNames::default().job_requests, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let request: JobRequest = delivery.decode().unwrap();
        assert_eq!(request.job_id, "nightly");
    }

    #[tokio::test]
    async fn test_run_submission_rejects_bad_input() {
        for body in [
            json!({"jobId": "", "dataDirectory": "2024"}),
            json!({"jobId": "nightly", "dataDirectory": "../etc"}),
            json!({"jobId": "nightly"}),
        ] {
            let t = test_app();
            let response = t.app.oneshot(post_run(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(response).await["error"]["status"], 400);
            assert_eq!(t.broker.pending(&QueueNames::default().job_requests).await, 0);
        }
    }

    #[tokio::test]
    async fn test_unknown_job_status_is_404() {
        let t = test_app();
        let response = t.app.oneshot(get("/api/jobs/nope/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_job_status_reports_latest_execution() {
        let t = test_app();
        let id = t
            .tracker
            .create_execution(&JobRequest::earthquake_ingestion("nightly", "2024"))
            .await
            .unwrap();
        t.tracker.mark_started(id).await.unwrap();
        t.tracker.finish(id, JobStatus::Completed, None).await.unwrap();

        let response = t.app.oneshot(get("/api/jobs/nightly/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["jobId"], "nightly");
        assert_eq!(body["executionId"], id);
        assert_eq!(body["status"], "COMPLETED");
        assert_eq!(body["workerCount"], 0);
        assert!(body["endTime"].is_string());
    }

    #[tokio::test]
    async fn test_execution_failure_lookup() {
        let t = test_app();
        let id = t
            .tracker
            .create_execution(&JobRequest::earthquake_ingestion("nightly", "2024"))
            .await
            .unwrap();
        t.tracker.finish(id, JobStatus::Failed, Some("launch failed")).await.unwrap();

        let response = t
            .app
            .clone()
            .oneshot(get(&format!("/api/execution-failures/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"exitCode": "FAILED", "exitDescription": "[managerStep]: launch failed"})
        );

        let missing = t.app.clone().oneshot(get("/api/execution-failures/999")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let invalid = t.app.oneshot(get("/api/execution-failures/abc")).await.unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_up() {
        let t = test_app();
        let response = t.app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "up");
    }
}
