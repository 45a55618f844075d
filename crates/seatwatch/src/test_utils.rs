//! Scripted collaborators shared by unit tests.

use crate::notify::{Mailer, SendOutcome};
use crate::source::{FetchError, TimetableSource};
use crate::types::{BlockType, CourseCode, CourseDetails, CourseSections, SectionInfo, TermInfo};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Queue of scripted replies; the last reply repeats once the rest are used up.
struct Script<T>(VecDeque<T>);

impl<T: Clone> Script<T> {
    fn next(&mut self) -> Option<T> {
        if self.0.len() > 1 {
            self.0.pop_front()
        } else {
            self.0.front().cloned()
        }
    }
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Script(VecDeque::new())
    }
}

/// [`TimetableSource`] replaying scripted results.
#[derive(Default)]
pub(crate) struct FakeSource {
    terms: Mutex<Script<Result<Vec<TermInfo>, FetchError>>>,
    courses: Mutex<HashMap<String, Script<Result<Vec<CourseCode>, FetchError>>>>,
    details: Mutex<Script<Result<CourseDetails, FetchError>>>,
    detail_delay: Mutex<Option<Duration>>,
    term_calls: AtomicUsize,
    detail_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl FakeSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_terms(&self, reply: Result<Vec<TermInfo>, FetchError>) {
        self.terms.lock().unwrap().0.push_back(reply);
    }

    pub(crate) fn push_courses(&self, term_id: &str, reply: Result<Vec<CourseCode>, FetchError>) {
        self.courses
            .lock()
            .unwrap()
            .entry(term_id.to_string())
            .or_default()
            .0
            .push_back(reply);
    }

    pub(crate) fn push_details(&self, reply: Result<CourseDetails, FetchError>) {
        self.details.lock().unwrap().0.push_back(reply);
    }

    pub(crate) fn set_detail_delay(&self, delay: Duration) {
        *self.detail_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn term_calls(&self) -> usize {
        self.term_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TimetableSource for FakeSource {
    async fn list_terms(&self) -> Result<Vec<TermInfo>, FetchError> {
        self.term_calls.fetch_add(1, Ordering::SeqCst);
        self.terms.lock().unwrap().next().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn list_courses(&self, term_id: &str) -> Result<Vec<CourseCode>, FetchError> {
        self.courses
            .lock()
            .unwrap()
            .get_mut(term_id)
            .and_then(Script::next)
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_section_details(
        &self,
        _term_id: &str,
        _course_codes: &[CourseCode],
    ) -> Result<CourseDetails, FetchError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.detail_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.details.lock().unwrap().next().unwrap_or_else(|| Ok(CourseDetails::new()))
    }

    async fn refresh_session(&self) -> Result<(), FetchError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// [`Mailer`] that records recipients and answers with a fixed outcome.
pub(crate) struct RecordingMailer {
    outcome: SendOutcome,
    delay: Option<Duration>,
    panic_on: Option<String>,
    sent: Mutex<Vec<String>>,
}

impl RecordingMailer {
    pub(crate) fn new(outcome: SendOutcome) -> Self {
        Self {
            outcome,
            delay: None,
            panic_on: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn panic_on(mut self, email: &str) -> Self {
        self.panic_on = Some(email.to_string());
        self
    }

    pub(crate) fn sent_to(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, _subject: &str, _body: &str) -> SendOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on.as_deref() == Some(to) {
            panic!("mailer exploded for {to}");
        }
        self.sent.lock().unwrap().push(to.to_string());
        self.outcome.clone()
    }
}

/// Details for a single course with one section.
pub(crate) fn details_with(course: &str, block_type: BlockType, section: &str, key: &str, open_seats: u32) -> CourseDetails {
    let mut sections = CourseSections::new();
    sections.insert(
        block_type,
        vec![SectionInfo {
            block_type,
            section: section.to_string(),
            key: key.to_string(),
            open_seats,
        }],
    );
    let mut details = CourseDetails::new();
    details.insert(course.to_string(), sections);
    details
}
