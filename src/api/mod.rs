//! HTTP surface: dispatch trigger and job inspection.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;
use uuid::Uuid;

use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::error::SyncError;
use crate::jobs::CrawlJobStore;

/// Shared state for the sync API
pub struct SyncAppState {
    pub dispatcher: Dispatcher,
    pub jobs: Arc<CrawlJobStore>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create the sync API router
pub fn create_sync_router(state: Arc<SyncAppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/dispatch", post(trigger_dispatch))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// POST /api/dispatch
///
/// Runs one dispatch pass and reports created job ids and skip counts.
async fn trigger_dispatch(
    State(state): State<Arc<SyncAppState>>,
    Json(request): Json<DispatchRequest>,
) -> Response {
    match state.dispatcher.dispatch(&request) {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(SyncError::Validation(msg)) => {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: msg })).into_response()
        }
        Err(err) => {
            error!(error = %err, "Dispatch pass failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "dispatch failed".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// GET /api/jobs/:id
///
/// Full job record, including the failure reason of a Failed job.
async fn get_job(State(state): State<Arc<SyncAppState>>, Path(id): Path<String>) -> Response {
    let id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "invalid job id".to_string(),
                }),
            )
                .into_response();
        }
    };

    match state.jobs.get(id) {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("job {id} not found"),
            }),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, job_id = %id, "Job lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "job lookup failed".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// POST /api/jobs/:id/cancel
///
/// Sets the cancellation flag; the executor honors it at the next page
/// boundary. Terminal or unknown jobs report 404.
async fn cancel_job(State(state): State<Arc<SyncAppState>>, Path(id): Path<String>) -> Response {
    let id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "invalid job id".to_string(),
                }),
            )
                .into_response();
        }
    };

    match state.jobs.request_cancel(id) {
        Ok(true) => (StatusCode::OK, Json(serde_json::json!({"cancelled": true}))).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no cancellable job {id}"),
            }),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, job_id = %id, "Cancel request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "cancel request failed".to_string(),
                }),
            )
                .into_response()
        }
    }
}
