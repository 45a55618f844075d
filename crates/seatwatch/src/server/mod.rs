use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::endpoints::{status, terms, watch};
use crate::service::SeatWatch;

mod endpoints;
pub mod types;

pub use endpoints::watch::WatchRequestBody;

/// Creates a router that can be used by `axum`.
///
/// # Parameters
/// - `app`: The running seat watcher.
///
/// # Returns
/// The router.
pub fn create_router(app: Arc<SeatWatch>) -> Router {
    Router::new()
        .route("/health", get(status::get_health))
        .route("/terms", get(terms::get_terms))
        .route("/terms/:term_id/courses", get(terms::get_courses))
        .route("/terms/:term_id/courses/:course_code", get(terms::get_course_details))
        .route("/watch", post(watch::post_watch))
        .with_state(app)
}

/// Serves the API on `bind` until ctrl-c, then stops the watcher.
pub async fn serve(app: Arc<SeatWatch>, bind: &str) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!(address = bind, "API server listening");

    axum::serve(listener, create_router(Arc::clone(&app)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    app.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Unable to listen for ctrl-c, shutting down");
        return;
    }
    info!("Received ctrl-c, shutting down");
}
