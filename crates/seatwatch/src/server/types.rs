use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::errors::WatchError;

/// Error body returned by every endpoint.
#[derive(Debug, Clone)]
pub struct ApiErrorType {
    status: StatusCode,
    error: String,
    details: Option<String>,
    request_id: Option<i64>,
    retry_after_secs: Option<u64>,
}

/// Suggested wait before retrying a request that failed for a transient reason.
pub const RETRY_AFTER_SECS: u64 = 30;

impl ApiErrorType {
    pub fn with_request_id(mut self, request_id: i64) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

impl<S: Into<String>> From<(StatusCode, S, Option<String>)> for ApiErrorType {
    fn from((status, error, details): (StatusCode, S, Option<String>)) -> Self {
        Self {
            status,
            error: error.into(),
            details,
            request_id: None,
            retry_after_secs: None,
        }
    }
}

impl From<&WatchError> for ApiErrorType {
    fn from(error: &WatchError) -> Self {
        let status = status_for(error);
        let mut api = ApiErrorType::from((status, error.to_string(), None));
        if error.is_retryable() {
            api.retry_after_secs = Some(RETRY_AFTER_SECS);
        }
        match error {
            WatchError::AlreadyPending { existing_id } => api.with_request_id(*existing_id),
            // Storage internals stay in the logs
            WatchError::Database { .. } => ApiErrorType {
                error: "Database error".to_string(),
                ..api
            },
            _ => api,
        }
    }
}

impl IntoResponse for ApiErrorType {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.error });
        if let Some(details) = self.details {
            body["details"] = json!(details);
        }
        if let Some(request_id) = self.request_id {
            body["request_id"] = json!(request_id);
        }
        match self.retry_after_secs {
            Some(secs) => (self.status, [(header::RETRY_AFTER, secs.to_string())], Json(body)).into_response(),
            None => (self.status, Json(body)).into_response(),
        }
    }
}

/// HTTP status for each add-watch outcome.
pub fn status_for(error: &WatchError) -> StatusCode {
    match error {
        WatchError::InvalidInput(_) | WatchError::SeatsAlreadyOpen { .. } => StatusCode::BAD_REQUEST,
        WatchError::TermNotFound { .. }
        | WatchError::CourseNotFound { .. }
        | WatchError::SectionNotFound { .. } => StatusCode::NOT_FOUND,
        WatchError::AlreadyPending { .. } => StatusCode::CONFLICT,
        WatchError::DataNotReady { .. } | WatchError::ExternalApi { .. } => StatusCode::SERVICE_UNAVAILABLE,
        WatchError::Database { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
