use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::errors::WatchError;
use crate::server::types::ApiErrorType;
use crate::service::SeatWatch;

/// Body of POST /watch.
#[derive(Debug, Deserialize)]
pub struct WatchRequestBody {
    pub email: String,
    pub term_id: String,
    pub course_code: String,
    pub section_key: String,
}

/// POST /watch
///
/// 201 for a new request, 200 when a finished request was reactivated.
pub async fn post_watch(State(s): State<Arc<SeatWatch>>, Json(body): Json<WatchRequestBody>) -> Response {
    info!(
        term_id = %body.term_id,
        course_code = %body.course_code,
        section_key = %body.section_key,
        "POST /watch"
    );

    match s
        .watch_service()
        .add_watch_request(&body.email, &body.term_id, &body.course_code, &body.section_key)
        .await
    {
        Ok(created) => {
            let code = if created.reactivated {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (code, Json(created)).into_response()
        }
        Err(e) => {
            match &e {
                WatchError::Database { message } => error!(error = %message, "Watch request failed"),
                other => warn!(error = %other, "Watch request rejected"),
            }
            ApiErrorType::from(&e).into_response()
        }
    }
}
