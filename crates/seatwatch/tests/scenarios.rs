use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use seatwatch::db::{NewWatch, StatusUpdate, UpsertOutcome};
use seatwatch::{
    AppConfig, BlockType, Collaborators, CourseCode, CourseDetails, CourseSections, FetchError, Mailer, SeatWatch,
    SectionInfo, SendOutcome, TermInfo, TimetableSource, WatchError, WatchStatus, WatchStore,
};

const TERM: &str = "2241";
const COURSE: &str = "COMPSCI 1JC3";
const SECTION: &str = "LEC_1_C01";

/// Upstream with one term, one course and one lecture section.
#[derive(Default)]
struct Timetable {
    open_seats: AtomicU32,
    /// Detail fetches return nothing
    blank: AtomicBool,
    detail_delay: Mutex<Option<Duration>>,
    refresh_calls: AtomicUsize,
}

impl Timetable {
    fn with_seats(seats: u32) -> Arc<Self> {
        let timetable = Arc::new(Self::default());
        timetable.open_seats.store(seats, Ordering::SeqCst);
        timetable
    }
}

#[async_trait]
impl TimetableSource for Timetable {
    async fn list_terms(&self) -> Result<Vec<TermInfo>, FetchError> {
        Ok(vec![TermInfo::new(TERM, "Winter 2024")])
    }

    async fn list_courses(&self, _term_id: &str) -> Result<Vec<CourseCode>, FetchError> {
        Ok(vec![COURSE.to_string()])
    }

    async fn fetch_section_details(
        &self,
        _term_id: &str,
        _course_codes: &[CourseCode],
    ) -> Result<CourseDetails, FetchError> {
        let delay = *self.detail_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.blank.load(Ordering::SeqCst) {
            return Ok(CourseDetails::new());
        }

        let mut sections = CourseSections::new();
        sections.insert(
            BlockType::Lec,
            vec![SectionInfo {
                block_type: BlockType::Lec,
                section: "C01".to_string(),
                key: SECTION.to_string(),
                open_seats: self.open_seats.load(Ordering::SeqCst),
            }],
        );
        Ok(HashMap::from([(COURSE.to_string(), sections)]))
    }

    async fn refresh_session(&self) -> Result<(), FetchError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Mailer for Outbox {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> SendOutcome {
        self.sent.lock().unwrap().push((to.to_string(), subject.to_string()));
        SendOutcome::Sent
    }
}

async fn watcher(timetable: Arc<Timetable>, outbox: Arc<Outbox>, fetch_timeout_secs: u64) -> SeatWatch {
    let mut config = AppConfig::default();
    config.intervals.confirm_delay_secs = 0;
    config.checker.fetch_timeout_secs = fetch_timeout_secs;
    let store = Arc::new(WatchStore::open_in_memory().unwrap());
    let app = SeatWatch::new(config, store, Collaborators::new(timetable, outbox)).unwrap();
    app.updater().refresh_once().await;
    app
}

async fn wait_for_status(app: &SeatWatch, id: i64, status: WatchStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if app.store().get(id).unwrap().map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn new_watch(email: &str) -> NewWatch {
    NewWatch {
        email: email.to_string(),
        term_id: TERM.to_string(),
        course_code: COURSE.to_string(),
        section_key: SECTION.to_string(),
        section_display: "LEC C01".to_string(),
    }
}

#[tokio::test]
async fn test_watch_is_notified_once_seats_open() {
    let timetable = Timetable::with_seats(0);
    let outbox = Arc::new(Outbox::default());
    let app = watcher(timetable.clone(), outbox.clone(), 5).await;

    let created = app
        .watch_service()
        .add_watch_request("alice@x.com", TERM, COURSE, SECTION)
        .await
        .unwrap();
    assert_eq!(created.request_id, 1);
    assert_eq!(app.store().get(1).unwrap().unwrap().status, WatchStatus::Pending);

    // Still closed: the row is only touched.
    let report = app.checker().run_cycle().await;
    assert_eq!(report.checked, 1);
    let row = app.store().get(1).unwrap().unwrap();
    assert_eq!(row.status, WatchStatus::Pending);
    assert!(row.last_checked_at.is_some());

    timetable.open_seats.store(5, Ordering::SeqCst);
    let report = app.checker().run_cycle().await;
    assert_eq!(report.enqueued, 1);
    wait_for_status(&app, 1, WatchStatus::Notified).await;

    let row = app.store().get(1).unwrap().unwrap();
    assert!(row.notified_at.is_some());
    let sent = outbox.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![("alice@x.com".to_string(), "Seat Alert: Seats Open in COMPSCI 1JC3".to_string())]);

    // Nothing left to check, so no second email.
    let report = app.checker().run_cycle().await;
    assert_eq!(report.pending, 0);
    app.shutdown().await;
    assert_eq!(outbox.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_open_section_cannot_be_watched() {
    let app = watcher(Timetable::with_seats(3), Arc::new(Outbox::default()), 5).await;

    let err = app
        .watch_service()
        .add_watch_request("alice@x.com", TERM, COURSE, SECTION)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        WatchError::SeatsAlreadyOpen {
            course_code: COURSE.to_string(),
            section_display: "LEC C01".to_string(),
            open_seats: 3,
        }
    );
    assert!(app.store().list_pending().unwrap().is_empty());
    app.shutdown().await;
}

#[tokio::test]
async fn test_slow_upstream_leaves_requests_untouched() {
    let timetable = Timetable::with_seats(5);
    let app = watcher(timetable.clone(), Arc::new(Outbox::default()), 1).await;
    app.store().upsert(&new_watch("alice@x.com")).unwrap();
    *timetable.detail_delay.lock().unwrap() = Some(Duration::from_secs(3));

    let report = app.checker().run_cycle().await;
    assert_eq!(report.deferred_terms, 1);
    assert_eq!(report.enqueued, 0);
    assert!(report.empty_cycle);

    let row = app.store().get(1).unwrap().unwrap();
    assert_eq!(row.status, WatchStatus::Pending);
    assert!(row.last_checked_at.is_none());
    app.shutdown().await;
}

#[tokio::test]
async fn test_three_empty_cycles_refresh_the_session_once() {
    let timetable = Timetable::with_seats(0);
    let app = watcher(timetable.clone(), Arc::new(Outbox::default()), 5).await;
    app.store().upsert(&new_watch("alice@x.com")).unwrap();
    timetable.blank.store(true, Ordering::SeqCst);

    let mut refreshed = Vec::new();
    for _ in 0..3 {
        refreshed.push(app.checker().run_cycle().await.session_refreshed);
    }
    assert_eq!(refreshed, vec![false, false, true]);
    assert_eq!(timetable.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(app.checker().empty_cycles(), 0);
    app.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_watch_is_rejected() {
    let app = watcher(Timetable::with_seats(0), Arc::new(Outbox::default()), 5).await;
    let first = app
        .watch_service()
        .add_watch_request("alice@x.com", TERM, COURSE, SECTION)
        .await
        .unwrap();

    let err = app
        .watch_service()
        .add_watch_request("ALICE@x.com ", TERM, "compsci 1jc3", SECTION)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        WatchError::AlreadyPending {
            existing_id: first.request_id
        }
    );
    assert_eq!(app.store().list_pending().unwrap().len(), 1);
    app.shutdown().await;
}

#[tokio::test]
async fn test_errored_watch_is_reactivated() {
    let app = watcher(Timetable::with_seats(0), Arc::new(Outbox::default()), 5).await;
    let outcome = app.store().upsert(&new_watch("alice@x.com")).unwrap();
    assert_eq!(outcome, UpsertOutcome::Created { id: 1 });
    app.store()
        .bulk_update_status(&StatusUpdate {
            errored: vec![1],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(app.store().get(1).unwrap().unwrap().status, WatchStatus::Error);

    let created = app
        .watch_service()
        .add_watch_request("alice@x.com", TERM, COURSE, SECTION)
        .await
        .unwrap();
    assert!(created.reactivated);
    assert_eq!(created.request_id, 1);

    let row = app.store().get(1).unwrap().unwrap();
    assert_eq!(row.status, WatchStatus::Pending);
    assert!(row.notified_at.is_none());
    app.shutdown().await;
}
