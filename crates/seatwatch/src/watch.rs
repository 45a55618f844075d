//! Validation and creation of watch requests.

use crate::cache::TermCache;
use crate::db::{NewWatch, WatchStore};
use crate::errors::WatchError;
use crate::source::{FetchError, TimetableSource};
use crate::types::{find_section, normalize_course_code, CourseCode, CourseSections};
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{info, warn};

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("email pattern is valid")
});

/// Returns true if `email` looks like a deliverable address.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email)
}

/// Successful add-watch result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchCreated {
    pub message: String,
    pub request_id: i64,
    pub reactivated: bool,
}

/// Entry point used by the API layer to register watches and read live details.
pub struct WatchService {
    cache: Arc<TermCache>,
    source: Arc<dyn TimetableSource>,
    store: Arc<WatchStore>,
    live_timeout: Duration,
}

impl WatchService {
    pub fn new(
        cache: Arc<TermCache>,
        source: Arc<dyn TimetableSource>,
        store: Arc<WatchStore>,
        live_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            source,
            store,
            live_timeout,
        }
    }

    /// Validates the target against cached and live data, then stores the watch.
    pub async fn add_watch_request(
        &self,
        email: &str,
        term_id: &str,
        course_code: &str,
        section_key: &str,
    ) -> Result<WatchCreated, WatchError> {
        let email = email.trim().to_lowercase();
        let term_id = term_id.trim();
        let course_code = normalize_course_code(course_code);
        let section_key = section_key.trim();

        if !is_valid_email(&email) {
            return Err(WatchError::InvalidInput(format!("Invalid email address format: '{email}'")));
        }
        if term_id.is_empty() || course_code.is_empty() || section_key.is_empty() {
            return Err(WatchError::InvalidInput(
                "term_id, course_code and section_key are required".to_string(),
            ));
        }

        self.require_course(term_id, &course_code)?;

        let sections = self.live_sections(term_id, &course_code).await?;
        let section = find_section(&sections, section_key).ok_or_else(|| {
            warn!(term_id, course_code = %course_code, section_key, "Section not found in live details");
            WatchError::SectionNotFound {
                section_key: section_key.to_string(),
                course_code: course_code.clone(),
                term_id: term_id.to_string(),
            }
        })?;

        let section_display = section.display_name();
        if section.open_seats > 0 {
            return Err(WatchError::SeatsAlreadyOpen {
                course_code,
                section_display,
                open_seats: section.open_seats,
            });
        }

        let watch = NewWatch {
            email,
            term_id: term_id.to_string(),
            course_code,
            section_key: section_key.to_string(),
            section_display,
        };
        let outcome = self.store.upsert(&watch)?;
        let reactivated = matches!(outcome, crate::db::UpsertOutcome::Reactivated { .. });
        info!(
            request_id = outcome.id(),
            term_id = %watch.term_id,
            course_code = %watch.course_code,
            section_key = %watch.section_key,
            reactivated,
            "Watch request accepted"
        );

        Ok(WatchCreated {
            message: outcome.message(&watch),
            request_id: outcome.id(),
            reactivated,
        })
    }

    /// Live section details for one cached course.
    pub async fn course_details(&self, term_id: &str, course_code: &str) -> Result<CourseSections, WatchError> {
        let course_code = normalize_course_code(course_code);
        self.require_course(term_id, &course_code)?;
        self.live_sections(term_id, &course_code).await
    }

    /// Course list for a cached term.
    pub fn courses(&self, term_id: &str) -> Result<Vec<CourseCode>, WatchError> {
        if !self.cache.has_term(term_id) {
            return Err(WatchError::TermNotFound {
                term_id: term_id.to_string(),
            });
        }
        self.cache.get_courses(term_id).ok_or_else(|| WatchError::DataNotReady {
            resource: format!("Course list for term '{term_id}'"),
        })
    }

    fn require_course(&self, term_id: &str, course_code: &str) -> Result<(), WatchError> {
        let courses = self.courses(term_id)?;
        if courses.iter().any(|c| c == course_code) {
            Ok(())
        } else {
            Err(WatchError::CourseNotFound {
                course_code: course_code.to_string(),
                term_id: term_id.to_string(),
            })
        }
    }

    async fn live_sections(&self, term_id: &str, course_code: &str) -> Result<CourseSections, WatchError> {
        let request = [course_code.to_string()];
        let fetched = tokio::time::timeout(self.live_timeout, self.source.fetch_section_details(term_id, &request))
            .await
            .unwrap_or_else(|_| {
                Err(FetchError::Timeout {
                    elapsed_secs: self.live_timeout.as_secs_f64(),
                })
            })
            .map_err(|e| {
                warn!(term_id, course_code, error = %e, "Live detail lookup failed");
                WatchError::from(e)
            })?;

        match fetched.get(course_code) {
            Some(sections) if !sections.is_empty() => Ok(sections.clone()),
            _ => Err(WatchError::ExternalApi {
                message: format!("No section details returned for {course_code} in term {term_id}"),
            }),
        }
    }
}
