//! Batch section-detail fetch with a hard deadline.
//!
//! Calls run one at a time on a spawned task holding a single permit. When
//! the deadline passes the task is aborted and its permit released, so an
//! upstream hang never stalls the check loop.

use crate::source::{FetchError, TimetableSource};
use crate::types::{details_are_usable, CourseCode, CourseDetails};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::debug;

/// Classified result of one batch fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// At least one course came back with sections
    Usable(CourseDetails),
    /// The call succeeded but nothing in it can be used
    Empty,
    Failed(FetchError),
}

impl FetchOutcome {
    pub fn is_usable(&self) -> bool {
        matches!(self, FetchOutcome::Usable(_))
    }
}

pub struct DetailFetcher {
    source: Arc<dyn TimetableSource>,
    slot: Arc<Semaphore>,
    timeout: Duration,
}

impl DetailFetcher {
    pub fn new(source: Arc<dyn TimetableSource>, timeout: Duration) -> Self {
        Self {
            source,
            slot: Arc::new(Semaphore::new(1)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetches details for `courses` in `term_id`, giving up after the timeout.
    ///
    /// Time spent waiting for the single slot counts against the same deadline.
    pub async fn fetch(&self, term_id: &str, courses: Vec<CourseCode>) -> FetchOutcome {
        let start = Instant::now();

        let permit = match tokio::time::timeout(self.timeout, Arc::clone(&self.slot).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return FetchOutcome::Failed(FetchError::UnexpectedResponse {
                    message: "detail fetch slot closed".to_string(),
                })
            }
            Err(_) => {
                return FetchOutcome::Failed(FetchError::Timeout {
                    elapsed_secs: start.elapsed().as_secs_f64(),
                })
            }
        };

        let source = Arc::clone(&self.source);
        let term = term_id.to_string();
        let course_count = courses.len();
        let mut handle = tokio::spawn(async move {
            let _permit = permit;
            source.fetch_section_details(&term, &courses).await
        });

        let remaining = self.timeout.saturating_sub(start.elapsed());
        let outcome = match tokio::time::timeout(remaining, &mut handle).await {
            Ok(Ok(Ok(details))) if details_are_usable(&details) => FetchOutcome::Usable(details),
            Ok(Ok(Ok(_))) => FetchOutcome::Empty,
            Ok(Ok(Err(e))) => FetchOutcome::Failed(e),
            Ok(Err(join_err)) => FetchOutcome::Failed(FetchError::UnexpectedResponse {
                message: format!("detail fetch task failed: {join_err}"),
            }),
            Err(_) => {
                handle.abort();
                FetchOutcome::Failed(FetchError::Timeout {
                    elapsed_secs: start.elapsed().as_secs_f64(),
                })
            }
        };

        debug!(
            term_id,
            courses = course_count,
            usable = outcome.is_usable(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Detail fetch finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{details_with, FakeSource};
    use crate::types::BlockType;

    #[tokio::test]
    async fn test_usable_details() {
        let source = Arc::new(FakeSource::new());
        source.push_details(Ok(details_with("COMPSCI 1JC3", BlockType::Lec, "C01", "LEC_1_C01", 0)));
        let fetcher = DetailFetcher::new(source, Duration::from_secs(5));

        let outcome = fetcher.fetch("2241", vec!["COMPSCI 1JC3".into()]).await;
        assert!(outcome.is_usable());
    }

    #[tokio::test]
    async fn test_empty_details() {
        let source = Arc::new(FakeSource::new());
        let fetcher = DetailFetcher::new(source, Duration::from_secs(5));

        let outcome = fetcher.fetch("2241", vec!["COMPSCI 1JC3".into()]).await;
        assert!(matches!(outcome, FetchOutcome::Empty));
    }

    #[tokio::test]
    async fn test_hung_fetch_times_out_and_frees_slot() {
        let source = Arc::new(FakeSource::new());
        source.set_detail_delay(Duration::from_secs(60));
        let fetcher = DetailFetcher::new(source.clone(), Duration::from_millis(50));

        let started = Instant::now();
        let outcome = fetcher.fetch("2241", vec!["COMPSCI 1JC3".into()]).await;
        assert!(matches!(outcome, FetchOutcome::Failed(FetchError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));

        // Aborted call released its slot, so the next one gets to run
        let outcome = fetcher.fetch("2241", vec!["COMPSCI 1JC3".into()]).await;
        assert!(matches!(outcome, FetchOutcome::Failed(FetchError::Timeout { .. })));
        assert_eq!(source.detail_calls(), 2);
    }

    #[tokio::test]
    async fn test_transport_error_is_failed() {
        let source = Arc::new(FakeSource::new());
        source.push_details(Err(FetchError::Network {
            message: "connection reset".into(),
        }));
        let fetcher = DetailFetcher::new(source, Duration::from_secs(5));

        let outcome = fetcher.fetch("2241", vec!["COMPSCI 1JC3".into()]).await;
        assert!(matches!(outcome, FetchOutcome::Failed(FetchError::Network { .. })));
    }
}
