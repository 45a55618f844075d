//! Background refresh of the term and course caches.
//!
//! Every refresh goes through the double-check in [`crate::cache::refresh`]:
//! a change seen once is re-read after a short delay and only committed when
//! both reads agree.

use crate::cache::refresh::{confirm, matches_cached, RefreshDecision};
use crate::cache::TermCache;
use crate::source::TimetableSource;
use crate::types::{normalize_course_code, CourseCode, TermInfo};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What happened to one cached value during a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Unchanged,
    Committed { count: usize },
    Inconsistent,
    SuspectedOutage,
    FetchFailed,
}

impl<T> From<&RefreshDecision<Vec<T>>> for RefreshOutcome {
    fn from(decision: &RefreshDecision<Vec<T>>) -> Self {
        match decision {
            RefreshDecision::Unchanged => RefreshOutcome::Unchanged,
            RefreshDecision::Commit(v) => RefreshOutcome::Committed { count: v.len() },
            RefreshDecision::Inconsistent => RefreshOutcome::Inconsistent,
            RefreshDecision::SuspectedOutage => RefreshOutcome::SuspectedOutage,
        }
    }
}

/// Per-term tallies of a course refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourseRefreshSummary {
    pub unchanged: usize,
    pub committed: usize,
    pub inconsistent: usize,
    pub suspected_outage: usize,
    pub failed: usize,
    pub pruned: usize,
}

impl CourseRefreshSummary {
    fn record(&mut self, outcome: RefreshOutcome) {
        match outcome {
            RefreshOutcome::Unchanged => self.unchanged += 1,
            RefreshOutcome::Committed { .. } => self.committed += 1,
            RefreshOutcome::Inconsistent => self.inconsistent += 1,
            RefreshOutcome::SuspectedOutage => self.suspected_outage += 1,
            RefreshOutcome::FetchFailed => self.failed += 1,
        }
    }
}

/// Result of one full refresh pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub terms: RefreshOutcome,
    pub courses: CourseRefreshSummary,
    pub duration_ms: u64,
}

/// Keeps [`TermCache`] in step with the upstream timetable.
pub struct CacheUpdater {
    source: Arc<dyn TimetableSource>,
    cache: Arc<TermCache>,
    confirm_delay: Duration,
}

impl CacheUpdater {
    pub fn new(source: Arc<dyn TimetableSource>, cache: Arc<TermCache>, confirm_delay: Duration) -> Self {
        Self {
            source,
            cache,
            confirm_delay,
        }
    }

    /// Refreshes terms, then the course lists of the resulting terms.
    pub async fn refresh_once(&self) -> RefreshReport {
        let start = Instant::now();
        let terms = self.refresh_terms().await;
        let courses = self.refresh_courses().await;
        RefreshReport {
            terms,
            courses,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Runs the double-check against the cached term list.
    pub async fn refresh_terms(&self) -> RefreshOutcome {
        let cached = self.cache.get_terms();

        let first = match self.source.list_terms().await {
            Ok(terms) => terms,
            Err(e) => {
                warn!(error = %e, "Term list fetch failed, keeping cached terms");
                return RefreshOutcome::FetchFailed;
            }
        };
        if matches_cached(Some(&cached), &first) {
            debug!(count = cached.len(), "Term list unchanged");
            return RefreshOutcome::Unchanged;
        }

        debug!(
            cached = cached.len(),
            fetched = first.len(),
            "Term list differs from cache, confirming"
        );
        tokio::time::sleep(self.confirm_delay).await;

        let second = match self.source.list_terms().await {
            Ok(terms) => terms,
            Err(e) => {
                warn!(error = %e, "Confirmation fetch of term list failed, keeping cached terms");
                return RefreshOutcome::FetchFailed;
            }
        };

        let decision = confirm(Some(&cached), first, &second);
        let outcome = RefreshOutcome::from(&decision);
        match decision {
            RefreshDecision::Commit(terms) => {
                info!(old = cached.len(), new = terms.len(), "Committing confirmed term list");
                self.cache.replace_terms(terms);
            }
            RefreshDecision::Inconsistent => {
                warn!("Term list fetches disagree, keeping cached terms");
            }
            RefreshDecision::SuspectedOutage => {
                error!(
                    cached = cached.len(),
                    "Upstream returned no terms twice, suspected outage; keeping cached terms"
                );
            }
            RefreshDecision::Unchanged => {}
        }
        outcome
    }

    /// Runs the double-check for the course list of every cached term.
    ///
    /// A term whose fetch fails keeps its previous list. Terms that are no
    /// longer listed are dropped from the course cache.
    pub async fn refresh_courses(&self) -> CourseRefreshSummary {
        let terms = self.cache.get_terms();
        let cached = self.cache.all_courses();
        let mut summary = CourseRefreshSummary::default();
        let mut pending: HashMap<String, Vec<CourseCode>> = HashMap::new();

        for term in &terms {
            match self.fetch_courses(term).await {
                Some(fetched) if matches_cached(cached.get(&term.id), &fetched) => {
                    summary.record(RefreshOutcome::Unchanged);
                }
                Some(fetched) => {
                    pending.insert(term.id.clone(), fetched);
                }
                None => summary.record(RefreshOutcome::FetchFailed),
            }
        }

        let mut next: HashMap<String, Vec<CourseCode>> = HashMap::new();
        let live: HashSet<&str> = terms.iter().map(|t| t.id.as_str()).collect();
        for (term_id, courses) in &cached {
            if live.contains(term_id.as_str()) {
                next.insert(term_id.clone(), courses.clone());
            } else {
                summary.pruned += 1;
            }
        }

        if !pending.is_empty() {
            debug!(terms = pending.len(), "Course lists differ from cache, confirming");
            tokio::time::sleep(self.confirm_delay).await;

            for term in &terms {
                let Some(first) = pending.remove(&term.id) else {
                    continue;
                };
                let Some(second) = self.fetch_courses(term).await else {
                    summary.record(RefreshOutcome::FetchFailed);
                    continue;
                };

                let decision = confirm(cached.get(&term.id), first, &second);
                summary.record(RefreshOutcome::from(&decision));
                match decision {
                    RefreshDecision::Commit(courses) => {
                        info!(term_id = %term.id, count = courses.len(), "Committing confirmed course list");
                        next.insert(term.id.clone(), courses);
                    }
                    RefreshDecision::Inconsistent => {
                        warn!(term_id = %term.id, "Course list fetches disagree, keeping cached list");
                    }
                    RefreshDecision::SuspectedOutage => {
                        error!(
                            term_id = %term.id,
                            "Upstream returned no courses twice, suspected outage; keeping cached list"
                        );
                    }
                    RefreshDecision::Unchanged => {}
                }
            }
        }

        if next != cached {
            self.cache.replace_courses(next);
        }
        summary
    }

    async fn fetch_courses(&self, term: &TermInfo) -> Option<Vec<CourseCode>> {
        match self.source.list_courses(&term.id).await {
            Ok(raw) => {
                let mut courses: Vec<CourseCode> = raw
                    .iter()
                    .map(|c| normalize_course_code(c))
                    .filter(|c| !c.is_empty())
                    .collect();
                courses.sort();
                courses.dedup();
                Some(courses)
            }
            Err(e) => {
                warn!(term_id = %term.id, error = %e, "Course list fetch failed");
                None
            }
        }
    }

    /// Refreshes immediately, then every `interval` until shutdown is signalled.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Cache update loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.refresh_once().await;
            let stats = self.cache.stats();
            info!(
                terms = ?report.terms,
                courses_committed = report.courses.committed,
                courses_failed = report.courses.failed,
                terms_pruned = report.courses.pruned,
                cached_terms = stats.term_count,
                cached_courses = stats.total_courses,
                duration_ms = report.duration_ms,
                "Cache refresh finished"
            );

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Cache update loop stopped");
    }
}
