//! Mapping of service errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::scheduler::SchedulerError;
use crate::storage::StorageError;
use crate::tracker::FetchError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tracker(#[from] FetchError),
}

impl ApiError {
    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Scheduler(SchedulerError::UnknownQuery(_)) => (StatusCode::NOT_FOUND, "QUERY_NOT_FOUND"),
            ApiError::Scheduler(SchedulerError::QueryDisabled(_)) => (StatusCode::CONFLICT, "QUERY_DISABLED"),
            ApiError::Scheduler(SchedulerError::Stopped) => (StatusCode::SERVICE_UNAVAILABLE, "SCHEDULER_STOPPED"),
            ApiError::Scheduler(SchedulerError::Storage(StorageError::Busy(_)))
            | ApiError::Storage(StorageError::Busy(_)) => (StatusCode::CONFLICT, "QUERY_BUSY"),
            ApiError::Scheduler(SchedulerError::Storage(_)) | ApiError::Storage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
            }
            ApiError::Tracker(e) if e.is_transient() => (StatusCode::BAD_GATEWAY, "TRACKER_UNAVAILABLE"),
            ApiError::Tracker(_) => (StatusCode::UNPROCESSABLE_ENTITY, "TRACKER_REJECTED"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        if status.is_server_error() {
            error!(code, error = %self, "request failed");
        }
        let body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
