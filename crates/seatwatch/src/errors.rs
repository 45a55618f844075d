//! Outcomes of the add-watch flow that callers are expected to match on.

use crate::db::StoreError;
use crate::source::FetchError;
use thiserror::Error;

/// Errors returned when creating or reactivating a watch request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatchError {
    /// Malformed caller input (e.g. email address)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Term '{term_id}' not found")]
    TermNotFound { term_id: String },

    #[error("Course '{course_code}' not found in term '{term_id}'")]
    CourseNotFound { course_code: String, term_id: String },

    #[error("Section '{section_key}' not found for course '{course_code}' in term '{term_id}'")]
    SectionNotFound {
        section_key: String,
        course_code: String,
        term_id: String,
    },

    /// Watching makes no sense when seats are already available
    #[error("{course_code} {section_display} already has {open_seats} open seat(s)")]
    SeatsAlreadyOpen {
        course_code: String,
        section_display: String,
        open_seats: u32,
    },

    #[error("You already have an active pending watch request (ID: {existing_id})")]
    AlreadyPending { existing_id: i64 },

    /// The cache has not loaded the data needed to validate yet
    #[error("{resource} not loaded yet, try again shortly")]
    DataNotReady { resource: String },

    /// The live lookup against the timetable failed
    #[error("Timetable service error: {message}")]
    ExternalApi { message: String },

    #[error("Database error: {message}")]
    Database { message: String },
}

impl WatchError {
    /// Returns true if the same request may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WatchError::DataNotReady { .. } | WatchError::ExternalApi { .. } | WatchError::Database { .. }
        )
    }
}

impl From<StoreError> for WatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyPending { id } => WatchError::AlreadyPending { existing_id: id },
            other => WatchError::Database {
                message: other.to_string(),
            },
        }
    }
}

impl From<FetchError> for WatchError {
    fn from(err: FetchError) -> Self {
        WatchError::ExternalApi {
            message: err.to_string(),
        }
    }
}
