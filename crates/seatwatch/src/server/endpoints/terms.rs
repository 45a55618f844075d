use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::server::types::ApiErrorType;
use crate::service::SeatWatch;

/// GET /terms
pub async fn get_terms(State(s): State<Arc<SeatWatch>>) -> Response {
    info!("GET /terms");

    let terms = s.cache().get_terms();
    if terms.is_empty() {
        return ApiErrorType::from((
            StatusCode::SERVICE_UNAVAILABLE,
            "Term data not loaded yet, try again shortly",
            None,
        ))
        .into_response();
    }
    (StatusCode::OK, Json(terms)).into_response()
}

/// GET /terms/:term_id/courses
pub async fn get_courses(Path(term_id): Path<String>, State(s): State<Arc<SeatWatch>>) -> Response {
    info!("GET /terms/{}/courses", term_id);

    match s.watch_service().courses(&term_id) {
        Ok(courses) => (
            StatusCode::OK,
            Json(json!({ "term_id": term_id, "courses": courses })),
        )
            .into_response(),
        Err(e) => ApiErrorType::from(&e).into_response(),
    }
}

/// GET /terms/:term_id/courses/:course_code
///
/// Live section details, bypassing the cache.
pub async fn get_course_details(
    Path((term_id, course_code)): Path<(String, String)>,
    State(s): State<Arc<SeatWatch>>,
) -> Response {
    info!("GET /terms/{}/courses/{}", term_id, course_code);

    match s.watch_service().course_details(&term_id, &course_code).await {
        Ok(sections) => (StatusCode::OK, Json(sections)).into_response(),
        Err(e) => {
            warn!(term_id = %term_id, course_code = %course_code, error = %e, "Course detail lookup failed");
            ApiErrorType::from(&e).into_response()
        }
    }
}
