//! Handlebars rendering of seat-alert emails

use super::{NotificationContext, RenderedEmail, Renderer};
use handlebars::Handlebars;
use std::path::Path;
use thiserror::Error;

const TEMPLATE_NAME: &str = "notification";
const DEFAULT_TEMPLATE: &str = include_str!("../../templates/notification.hbs");

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to register template: {0}")]
    Template(#[from] handlebars::TemplateError),

    #[error("Failed to render template: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// Renders the HTML body from a Handlebars template
pub struct HandlebarsRenderer {
    handlebars: Handlebars<'static>,
}

impl HandlebarsRenderer {
    /// Renderer using the built-in template
    pub fn new() -> Result<Self, RenderError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars.register_template_string(TEMPLATE_NAME, DEFAULT_TEMPLATE)?;
        Ok(Self { handlebars })
    }

    /// Renderer using a template file on disk
    pub fn with_template(template_path: &Path) -> Result<Self, RenderError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars.register_template_file(TEMPLATE_NAME, template_path)?;
        Ok(Self { handlebars })
    }
}

impl Renderer for HandlebarsRenderer {
    fn render(&self, context: &NotificationContext) -> Result<RenderedEmail, RenderError> {
        let body = self.handlebars.render(TEMPLATE_NAME, context)?;
        Ok(RenderedEmail {
            subject: format!("Seat Alert: Seats Open in {}", context.course_code),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{WatchRequest, WatchStatus};
    use chrono::{TimeZone, Utc};
    use std::io::Write;

    fn context(open_seats: u32) -> NotificationContext {
        let request = WatchRequest {
            id: 1,
            email: "alice@x.com".into(),
            term_id: "2241".into(),
            course_code: "COMPSCI 1JC3".into(),
            section_key: "LEC_1_C01".into(),
            section_display: "LEC C01".into(),
            status: WatchStatus::Pending,
            created_at: Utc::now(),
            last_checked_at: None,
            notified_at: None,
        };
        let at = Utc.with_ymd_and_hms(2024, 1, 8, 9, 30, 0).unwrap();
        NotificationContext::new(&request, None, open_seats, at, "https://mytimetable.mcmaster.ca")
    }

    #[test]
    fn test_render_default_template() {
        let renderer = HandlebarsRenderer::new().unwrap();
        let email = renderer.render(&context(5)).unwrap();

        assert_eq!(email.subject, "Seat Alert: Seats Open in COMPSCI 1JC3");
        assert!(email.body.contains("LEC C01"));
        assert!(email.body.contains("5 open seats"));
        assert!(email.body.contains("Term ID 2241"));
        assert!(email.body.contains("2024-01-08 09:30:00 UTC"));
    }

    #[test]
    fn test_singular_seat() {
        let renderer = HandlebarsRenderer::new().unwrap();
        let email = renderer.render(&context(1)).unwrap();
        assert!(email.body.contains("1 open seat</strong>"));
    }

    #[test]
    fn test_strict_mode_rejects_unknown_variable() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "Hello {{{{missing_field}}}}").unwrap();

        let renderer = HandlebarsRenderer::with_template(file.path()).unwrap();
        assert!(matches!(renderer.render(&context(2)), Err(RenderError::Render(_))));
    }
}
