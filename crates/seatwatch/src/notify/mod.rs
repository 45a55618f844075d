//! Seat-alert emails: content, delivery contract and the send queue.
//!
//! Rendering and delivery are collaborators behind [`Renderer`] and
//! [`Mailer`]; [`NotificationDispatcher`] owns the bounded queue and the
//! worker pool that reports outcomes back to the store.

pub mod dispatcher;
pub mod render;

pub use dispatcher::{DispatchStats, EnqueueOutcome, NotificationDispatcher};
pub use render::{HandlebarsRenderer, RenderError};

use crate::types::WatchRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Values available to the notification template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationContext {
    pub request_id: i64,
    pub course_code: String,
    pub term_id: String,
    pub term_name: String,
    pub section_display: String,
    pub section_key: String,
    pub open_seats: u32,
    pub plural: bool,
    pub check_time: String,
    pub timetable_url: String,
}

impl NotificationContext {
    /// Builds the context for `request`, falling back to `Term ID {id}` when
    /// the term name is not known.
    pub fn new(
        request: &WatchRequest,
        term_name: Option<&str>,
        open_seats: u32,
        checked_at: DateTime<Utc>,
        timetable_base_url: &str,
    ) -> Self {
        Self {
            request_id: request.id,
            course_code: request.course_code.clone(),
            term_id: request.term_id.clone(),
            term_name: term_name
                .map(str::to_string)
                .unwrap_or_else(|| format!("Term ID {}", request.term_id)),
            section_display: request.section_display.clone(),
            section_key: request.section_key.clone(),
            open_seats,
            plural: open_seats != 1,
            check_time: checked_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            timetable_url: course_deep_link(timetable_base_url, &request.term_id, &request.course_code),
        }
    }
}

/// Link straight to the course in the public timetable, e.g.
/// `.../criteria.jsp?term=2241&course_0_0=COMPSCI-1JC3`.
pub fn course_deep_link(base_url: &str, term_id: &str, course_code: &str) -> String {
    format!(
        "{}/criteria.jsp?term={}&course_0_0={}",
        base_url.trim_end_matches('/'),
        term_id,
        course_code.replace(' ', "-")
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

/// Turns a [`NotificationContext`] into email content.
pub trait Renderer: Send + Sync {
    fn render(&self, context: &NotificationContext) -> Result<RenderedEmail, RenderError>;
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The recipient address itself was rejected
    PermanentRecipientFailure(String),
    /// Anything else; the request is retried on a later cycle
    TransientFailure(String),
}

/// Email delivery collaborator.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> SendOutcome;
}

/// One queued email for a watch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTask {
    pub request_id: i64,
    pub email: String,
    pub subject: String,
    pub body: String,
}

impl NotificationTask {
    pub fn new(request: &WatchRequest, email: RenderedEmail) -> Self {
        Self {
            request_id: request.id,
            email: request.email.clone(),
            subject: email.subject,
            body: email.body,
        }
    }
}
