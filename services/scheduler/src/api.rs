//! The scheduler HTTP API: POST /schedule, /migrate, /unschedule.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use flotilla_api::{Error, Job};

use crate::scheduler::Scheduler;

pub fn router(scheduler: Scheduler) -> Router {
    Router::new()
        .route("/schedule", post(handle_schedule))
        .route("/migrate", post(handle_migrate))
        .route("/unschedule", post(handle_unschedule))
        .with_state(scheduler)
        .layer(TraceLayer::new_for_http())
}

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AgentUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::OperationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::RuntimeFailure(_) | Error::Lost(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

async fn handle_schedule(
    State(scheduler): State<Scheduler>,
    Json(job): Json<Job>,
) -> Result<StatusCode, ApiError> {
    scheduler.schedule(job).await?;
    Ok(StatusCode::OK)
}

/// Both jobs of a migration: the one running and the one wanted.
#[derive(Debug, Deserialize)]
struct MigrateRequest {
    existing_job: Job,
    new_job: Job,
}

async fn handle_migrate(
    State(scheduler): State<Scheduler>,
    Json(request): Json<MigrateRequest>,
) -> Result<StatusCode, ApiError> {
    scheduler
        .migrate(request.existing_job, request.new_job)
        .await?;
    Ok(StatusCode::OK)
}

async fn handle_unschedule(
    State(scheduler): State<Scheduler>,
    Json(job): Json<Job>,
) -> Result<StatusCode, ApiError> {
    scheduler.unschedule(job).await?;
    Ok(StatusCode::OK)
}
