//! Periodic check of pending watch requests against live seat counts.
//!
//! One cycle:
//! 1. Load pending requests and group them by term
//! 2. Mark requests for terms that are no longer offered as errors
//! 3. Fetch section details once per term under a hard timeout
//! 4. Classify each request and hand open sections to the dispatcher
//! 5. Write all status changes back in one batch
//!
//! Cycles where every attempted fetch was unusable are counted; after enough
//! of them in a row the upstream session is reset.

pub mod fetch;

pub use fetch::{DetailFetcher, FetchOutcome};

use crate::cache::TermCache;
use crate::db::{StatusUpdate, WatchStore};
use crate::notify::{EnqueueOutcome, NotificationContext, NotificationDispatcher, NotificationTask, Renderer};
use crate::source::TimetableSource;
use crate::types::{find_section, CourseCode, CourseDetails, WatchRequest};
use chrono::Utc;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Tunables for [`WatchChecker`].
#[derive(Debug, Clone)]
pub struct CheckerSettings {
    pub fetch_timeout: Duration,
    /// Consecutive empty cycles before the upstream session is reset
    pub empty_cycle_threshold: u32,
    /// Base URL used for deep links in notification emails
    pub timetable_url: String,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(5),
            empty_cycle_threshold: 3,
            timetable_url: "https://mytimetable.mcmaster.ca".to_string(),
        }
    }
}

/// Summary of one check cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle_id: String,
    pub pending: usize,
    pub enqueued: usize,
    pub errored: usize,
    pub checked: usize,
    /// Requests skipped because a send for them is still in flight
    pub in_flight: usize,
    /// Terms whose fetch failed or was unusable
    pub deferred_terms: usize,
    /// Set when the term cache was empty and nothing was evaluated
    pub skipped: bool,
    pub empty_cycle: bool,
    pub session_refreshed: bool,
}

/// What to do with a single request after its term was fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Still pending, touch `last_checked_at`
    StillClosed,
    /// Section no longer exists
    Retired,
    Open(u32),
}

fn classify(request: &WatchRequest, details: &CourseDetails) -> Verdict {
    let Some(sections) = details.get(&request.course_code) else {
        // Data for one course may lag behind the rest of the batch
        return Verdict::StillClosed;
    };
    match find_section(sections, &request.section_key) {
        None => Verdict::Retired,
        Some(section) if section.open_seats > 0 => Verdict::Open(section.open_seats),
        Some(_) => Verdict::StillClosed,
    }
}

pub struct WatchChecker {
    store: Arc<WatchStore>,
    cache: Arc<TermCache>,
    source: Arc<dyn TimetableSource>,
    fetcher: DetailFetcher,
    dispatcher: Arc<NotificationDispatcher>,
    renderer: Arc<dyn Renderer>,
    settings: CheckerSettings,
    empty_cycles: AtomicU32,
}

impl WatchChecker {
    pub fn new(
        store: Arc<WatchStore>,
        cache: Arc<TermCache>,
        source: Arc<dyn TimetableSource>,
        dispatcher: Arc<NotificationDispatcher>,
        renderer: Arc<dyn Renderer>,
        settings: CheckerSettings,
    ) -> Self {
        let fetcher = DetailFetcher::new(Arc::clone(&source), settings.fetch_timeout);
        Self {
            store,
            cache,
            source,
            fetcher,
            dispatcher,
            renderer,
            settings,
            empty_cycles: AtomicU32::new(0),
        }
    }

    /// Current run of consecutive empty cycles.
    pub fn empty_cycles(&self) -> u32 {
        self.empty_cycles.load(Ordering::SeqCst)
    }

    /// Runs one full check cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let start = Instant::now();
        let mut report = CycleReport {
            cycle_id: generate_cycle_id(),
            ..Default::default()
        };
        let cycle_id = report.cycle_id.clone();

        let pending = match self.store.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                error!(cycle_id = %cycle_id, error = %e, "Failed to load pending requests");
                return report;
            }
        };
        report.pending = pending.len();
        if pending.is_empty() {
            debug!(cycle_id = %cycle_id, "No pending watch requests");
            return report;
        }

        let terms = self.cache.get_terms();
        if terms.is_empty() {
            warn!(cycle_id = %cycle_id, pending = report.pending, "Term cache not loaded, skipping check cycle");
            report.skipped = true;
            return report;
        }

        let mut by_term: BTreeMap<String, Vec<WatchRequest>> = BTreeMap::new();
        for request in pending {
            by_term.entry(request.term_id.clone()).or_default().push(request);
        }
        info!(cycle_id = %cycle_id, pending = report.pending, terms = by_term.len(), "Starting check cycle");

        let mut update = StatusUpdate::default();
        let mut attempted = 0usize;
        let mut usable = 0usize;
        let mut session_expired = false;

        for (term_id, requests) in by_term {
            let Some(term) = terms.iter().find(|t| t.id == term_id) else {
                warn!(
                    cycle_id = %cycle_id,
                    term_id = %term_id,
                    requests = requests.len(),
                    "Term no longer offered, marking its requests as error"
                );
                update.errored.extend(requests.iter().map(|r| r.id));
                continue;
            };

            let (busy, requests): (Vec<WatchRequest>, Vec<WatchRequest>) = requests
                .into_iter()
                .partition(|r| self.dispatcher.is_in_flight(r.id));
            report.in_flight += busy.len();
            if requests.is_empty() {
                continue;
            }

            let mut courses: Vec<CourseCode> = requests.iter().map(|r| r.course_code.clone()).collect();
            courses.sort();
            courses.dedup();

            attempted += 1;
            let details = match self.fetcher.fetch(&term_id, courses).await {
                FetchOutcome::Usable(details) => {
                    usable += 1;
                    details
                }
                FetchOutcome::Empty => {
                    warn!(cycle_id = %cycle_id, term_id = %term_id, "Detail fetch returned no usable data, retrying next cycle");
                    report.deferred_terms += 1;
                    continue;
                }
                FetchOutcome::Failed(e) => {
                    if e.is_retryable() {
                        warn!(cycle_id = %cycle_id, term_id = %term_id, error = %e, "Detail fetch failed, retrying next cycle");
                    } else {
                        error!(cycle_id = %cycle_id, term_id = %term_id, error = %e, "Detail fetch failed, retrying next cycle");
                    }
                    session_expired |= e.needs_reauth();
                    report.deferred_terms += 1;
                    continue;
                }
            };

            let checked_at = Utc::now();
            for request in &requests {
                match classify(request, &details) {
                    Verdict::StillClosed => update.checked.push(request.id),
                    Verdict::Retired => {
                        warn!(
                            cycle_id = %cycle_id,
                            request_id = request.id,
                            section_key = %request.section_key,
                            course_code = %request.course_code,
                            "Watched section no longer exists, marking as error"
                        );
                        update.errored.push(request.id);
                    }
                    Verdict::Open(open_seats) => {
                        let context = NotificationContext::new(
                            request,
                            Some(term.name.as_str()),
                            open_seats,
                            checked_at,
                            &self.settings.timetable_url,
                        );
                        if self.hand_off(&cycle_id, request, &context) {
                            report.enqueued += 1;
                        } else {
                            update.checked.push(request.id);
                        }
                    }
                }
            }
        }

        report.errored = update.errored.len();
        report.checked = update.checked.len();

        if !update.is_empty() {
            if let Err(e) = self.store.bulk_update_status(&update) {
                error!(cycle_id = %cycle_id, error = %e, "Failed to write check cycle results");
            }
        }

        report.empty_cycle = attempted > 0 && usable == 0;
        if session_expired {
            warn!(cycle_id = %cycle_id, "Upstream rejected the session, refreshing");
            self.refresh_session(&cycle_id).await;
            report.session_refreshed = true;
        } else if report.empty_cycle {
            report.session_refreshed = self.record_empty_cycle(&cycle_id).await;
        } else if usable > 0 {
            self.empty_cycles.store(0, Ordering::SeqCst);
        }

        info!(
            cycle_id = %cycle_id,
            enqueued = report.enqueued,
            errored = report.errored,
            checked = report.checked,
            deferred_terms = report.deferred_terms,
            duration_ms = start.elapsed().as_millis() as u64,
            "Check cycle finished"
        );
        report
    }

    /// Renders and queues the alert. Returns false if the request stays pending.
    fn hand_off(&self, cycle_id: &str, request: &WatchRequest, context: &NotificationContext) -> bool {
        let email = match self.renderer.render(context) {
            Ok(email) => email,
            Err(e) => {
                error!(cycle_id, request_id = request.id, error = %e, "Failed to render notification, request stays pending");
                return false;
            }
        };

        match self.dispatcher.enqueue(NotificationTask::new(request, email)) {
            EnqueueOutcome::Queued => {
                info!(
                    cycle_id,
                    request_id = request.id,
                    course_code = %request.course_code,
                    section = %request.section_display,
                    open_seats = context.open_seats,
                    "Seats open, notification queued"
                );
                true
            }
            // Raced with a worker that just picked it up; the worker owns the outcome.
            EnqueueOutcome::AlreadyInFlight => true,
            EnqueueOutcome::QueueFull | EnqueueOutcome::Closed => false,
        }
    }

    /// Bumps the empty-cycle counter and resets the session once it hits the threshold.
    async fn record_empty_cycle(&self, cycle_id: &str) -> bool {
        let count = self.empty_cycles.fetch_add(1, Ordering::SeqCst) + 1;
        if count < self.settings.empty_cycle_threshold {
            warn!(cycle_id, empty_cycles = count, "No term produced usable data this cycle");
            return false;
        }

        warn!(cycle_id, empty_cycles = count, "Upstream session looks stale, refreshing");
        self.refresh_session(cycle_id).await;
        true
    }

    async fn refresh_session(&self, cycle_id: &str) {
        self.empty_cycles.store(0, Ordering::SeqCst);
        match self.source.refresh_session().await {
            Ok(()) => info!(cycle_id, "Upstream session refreshed"),
            Err(e) => error!(cycle_id, error = %e, "Upstream session refresh failed"),
        }
    }

    /// Waits `initial_delay`, then runs a cycle every `interval` until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, initial_delay: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            initial_delay_secs = initial_delay.as_secs(),
            "Watch check loop started"
        );

        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {}
            _ = shutdown.changed() => {
                info!("Watch check loop stopped before first cycle");
                return;
            }
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Watch check loop stopped");
    }
}

/// Short random id attached to every log line of one cycle.
fn generate_cycle_id() -> String {
    let timestamp = Utc::now().timestamp_micros() as u64;
    let random: u32 = rand::thread_rng().gen();
    format!("{:x}-{:08x}", timestamp & 0xFFFF_FFFF, random)
}
