//! Contract for the upstream timetable collaborator.
//!
//! Scraping and parsing of the upstream pages lives behind this trait; the
//! watcher only ever sees structured terms, course codes and sections.

use crate::types::{CourseCode, CourseDetails, TermInfo};
use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a [`TimetableSource`].
#[derive(Debug, Error, Clone)]
pub enum FetchError {
    /// Network/HTTP request failed
    #[error("Network error: {message}")]
    Network { message: String },

    /// The call did not finish within its time budget
    #[error("Timed out after {elapsed_secs:.1}s")]
    Timeout { elapsed_secs: f64 },

    /// Upstream session (cookies, token) is no longer accepted
    #[error("Session expired: {message}")]
    SessionExpired { message: String },

    /// Upstream answered with something that could not be used
    #[error("Unexpected response: {message}")]
    UnexpectedResponse { message: String },
}

impl FetchError {
    /// Returns true if this error is potentially transient and retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network { .. } | FetchError::Timeout { .. } | FetchError::UnexpectedResponse { .. }
        )
    }

    /// Returns true if the upstream session should be refreshed.
    pub fn needs_reauth(&self) -> bool {
        matches!(self, FetchError::SessionExpired { .. })
    }
}

/// Supplies term lists, course lists and live section details.
///
/// Implementations may return empty or partial data without failing; callers
/// treat an empty detail map the same as an error.
#[async_trait]
pub trait TimetableSource: Send + Sync {
    /// Lists the currently offered terms.
    async fn list_terms(&self) -> Result<Vec<TermInfo>, FetchError>;

    /// Lists course codes offered in `term_id`.
    async fn list_courses(&self, term_id: &str) -> Result<Vec<CourseCode>, FetchError>;

    /// Fetches section details for a batch of courses in one term.
    async fn fetch_section_details(
        &self,
        term_id: &str,
        course_codes: &[CourseCode],
    ) -> Result<CourseDetails, FetchError>;

    /// Resets session state (cookies, tokens). Best effort.
    async fn refresh_session(&self) -> Result<(), FetchError>;
}
