use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::debug;

use crate::service::{HealthStatus, SeatWatch};

/// GET /health
pub async fn get_health(State(s): State<Arc<SeatWatch>>) -> Response {
    debug!("GET /health");

    let report = s.health();
    let code = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (code, Json(report)).into_response()
}
