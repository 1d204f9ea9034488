//! HTTP surface
//!
//! - `/api/jobs` - run submission, status and failure queries
//! - `/health` - broker and tracker liveness

pub mod jobs;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;

use crate::broker::{MessageBroker, QueueNames};
use crate::ingest::JobStore;

/// Shared state for all routes
#[derive(Clone)]
pub struct ApiState {
    pub broker: Arc<dyn MessageBroker>,
    pub queues: QueueNames,
    pub tracker: Arc<dyn JobStore>,
}

/// Creates the application router without middleware
pub fn router(state: ApiState) -> Router<()> {
    Router::new()
        .nest("/api", jobs::jobs_routes())
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let broker = state.broker.ping().await;
    let tracker = state.tracker.ping().await;

    let status = if broker.is_ok() && tracker.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    if let Err(ref e) = broker {
        tracing::warn!(error = %e, "Broker health check failed");
    }
    if let Err(ref e) = tracker {
        tracing::warn!(error = %e, "Tracker health check failed");
    }

    let check = |ok: bool| if ok { "up" } else { "down" };
    (
        status,
        Json(json!({
            "status": check(status == StatusCode::OK),
            "broker": check(broker.is_ok()),
            "database": check(tracker.is_ok()),
        })),
    )
}
