//! Bounded notification queue drained by a fixed worker pool.

use super::{Mailer, NotificationTask, SendOutcome};
use crate::db::{StatusUpdate, WatchStore};
use crate::types::WatchStatus;
use dashmap::DashSet;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What happened to a task handed to [`NotificationDispatcher::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// A task for the same request is queued or being sent
    AlreadyInFlight,
    QueueFull,
    /// The dispatcher has been shut down
    Closed,
}

/// Delivery counters since startup.
#[derive(Debug, Default)]
pub struct DispatchStats {
    sent: AtomicU64,
    permanent_failures: AtomicU64,
    transient_failures: AtomicU64,
    panics: AtomicU64,
    skipped: AtomicU64,
}

impl DispatchStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn permanent_failures(&self) -> u64 {
        self.permanent_failures.load(Ordering::Relaxed)
    }

    pub fn transient_failures(&self) -> u64 {
        self.transient_failures.load(Ordering::Relaxed)
    }

    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Tasks dropped because their request was already finished
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Sends seat alerts on a pool of workers and records each outcome.
///
/// Request ids are tracked from enqueue until their outcome is stored, so a
/// later check cycle cannot queue a second email for the same request.
pub struct NotificationDispatcher {
    sender: Mutex<Option<mpsc::Sender<NotificationTask>>>,
    in_flight: Arc<DashSet<i64>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<DispatchStats>,
}

impl NotificationDispatcher {
    /// Spawns `workers` tasks reading from a queue of `capacity` slots.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(store: Arc<WatchStore>, mailer: Arc<dyn Mailer>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<NotificationTask>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let in_flight = Arc::new(DashSet::new());
        let stats = Arc::new(DispatchStats::default());

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let store = Arc::clone(&store);
                let mailer = Arc::clone(&mailer);
                let in_flight = Arc::clone(&in_flight);
                let stats = Arc::clone(&stats);

                tokio::spawn(async move {
                    loop {
                        let task = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        let Some(task) = task else {
                            break; // Channel closed
                        };

                        let request_id = task.request_id;
                        let processed = AssertUnwindSafe(process_task(&store, mailer.as_ref(), &stats, &task))
                            .catch_unwind()
                            .await;
                        if processed.is_err() {
                            stats.panics.fetch_add(1, Ordering::Relaxed);
                            error!(worker_id, request_id, "Notification task panicked, request stays pending");
                        }
                        in_flight.remove(&request_id);
                    }

                    debug!(worker_id, "Notification worker shutting down");
                })
            })
            .collect();

        info!(workers = workers.max(1), capacity = capacity.max(1), "Notification dispatcher started");

        Self {
            sender: Mutex::new(Some(tx)),
            in_flight,
            workers: Mutex::new(handles),
            stats,
        }
    }

    /// Queues a task without waiting for space.
    pub fn enqueue(&self, task: NotificationTask) -> EnqueueOutcome {
        let request_id = task.request_id;
        if !self.in_flight.insert(request_id) {
            return EnqueueOutcome::AlreadyInFlight;
        }

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(sender) = sender else {
            self.in_flight.remove(&request_id);
            return EnqueueOutcome::Closed;
        };

        match sender.try_send(task) {
            Ok(()) => {
                debug!(request_id, "Notification queued");
                EnqueueOutcome::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.in_flight.remove(&request_id);
                warn!(request_id, "Notification queue full, will retry next cycle");
                EnqueueOutcome::QueueFull
            }
            Err(TrySendError::Closed(_)) => {
                self.in_flight.remove(&request_id);
                EnqueueOutcome::Closed
            }
        }
    }

    pub fn is_in_flight(&self, request_id: i64) -> bool {
        self.in_flight.contains(&request_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Returns true while at least one worker is still running.
    pub fn is_running(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|h| !h.is_finished())
    }

    /// Stops accepting tasks, lets workers drain the queue and waits for them.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Notification worker ended abnormally");
            }
        }
        info!(
            sent = self.stats.sent(),
            permanent_failures = self.stats.permanent_failures(),
            "Notification dispatcher stopped"
        );
    }
}

const OUTCOME_WRITE_ATTEMPTS: u32 = 3;

async fn process_task(store: &WatchStore, mailer: &dyn Mailer, stats: &DispatchStats, task: &NotificationTask) {
    let request_id = task.request_id;

    // A cycle working from an older pending list may queue a request that
    // another worker has already finished.
    match store.get(request_id) {
        Ok(Some(row)) if row.status == WatchStatus::Pending => {}
        Ok(Some(row)) => {
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(request_id, status = %row.status, "Request no longer pending, not sending");
            return;
        }
        Ok(None) => {
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            warn!(request_id, "Request disappeared before sending");
            return;
        }
        Err(e) => {
            error!(request_id, error = %e, "Failed to re-read request, will retry next cycle");
            return;
        }
    }

    let update = match mailer.send(&task.email, &task.subject, &task.body).await {
        SendOutcome::Sent => {
            stats.sent.fetch_add(1, Ordering::Relaxed);
            info!(request_id, "Notification sent");
            StatusUpdate {
                notified: vec![request_id],
                ..Default::default()
            }
        }
        SendOutcome::PermanentRecipientFailure(reason) => {
            stats.permanent_failures.fetch_add(1, Ordering::Relaxed);
            warn!(request_id, reason = %reason, "Recipient rejected, marking request as error");
            StatusUpdate {
                errored: vec![request_id],
                ..Default::default()
            }
        }
        SendOutcome::TransientFailure(reason) => {
            stats.transient_failures.fetch_add(1, Ordering::Relaxed);
            warn!(request_id, reason = %reason, "Send failed, request stays pending");
            return;
        }
    };

    record_outcome(store, request_id, &update).await;
}

/// Writes a send outcome, retrying while the database is busy.
async fn record_outcome(store: &WatchStore, request_id: i64, update: &StatusUpdate) {
    let mut attempt = 1;
    loop {
        match store.bulk_update_status(update) {
            Ok(_) => return,
            Err(e) if e.is_retryable() && attempt < OUTCOME_WRITE_ATTEMPTS => {
                warn!(request_id, attempt, error = %e, "Database busy, retrying outcome write");
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to record notification outcome");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewWatch;
    use crate::test_utils::RecordingMailer;

    fn store_with_request() -> (Arc<WatchStore>, i64) {
        let store = Arc::new(WatchStore::open_in_memory().unwrap());
        let id = store
            .upsert(&NewWatch {
                email: "alice@x.com".into(),
                term_id: "2241".into(),
                course_code: "COMPSCI 1JC3".into(),
                section_key: "LEC_1_C01".into(),
                section_display: "LEC C01".into(),
            })
            .unwrap()
            .id();
        (store, id)
    }

    fn task(request_id: i64) -> NotificationTask {
        NotificationTask {
            request_id,
            email: "alice@x.com".into(),
            subject: "Seat Alert: Seats Open in COMPSCI 1JC3".into(),
            body: "<p>open</p>".into(),
        }
    }

    #[tokio::test]
    async fn test_sent_marks_notified() {
        let (store, id) = store_with_request();
        let mailer = Arc::new(RecordingMailer::new(SendOutcome::Sent));
        let dispatcher = NotificationDispatcher::start(store.clone(), mailer.clone(), 2, 8);

        assert_eq!(dispatcher.enqueue(task(id)), EnqueueOutcome::Queued);
        dispatcher.shutdown().await;

        let row = store.get(id).unwrap().unwrap();
        assert_eq!(row.status, WatchStatus::Notified);
        assert!(row.notified_at.is_some());
        assert_eq!(mailer.sent_to(), vec!["alice@x.com".to_string()]);
        assert_eq!(dispatcher.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_marks_error() {
        let (store, id) = store_with_request();
        let mailer = Arc::new(RecordingMailer::new(SendOutcome::PermanentRecipientFailure(
            "550 no such user".into(),
        )));
        let dispatcher = NotificationDispatcher::start(store.clone(), mailer, 1, 8);

        dispatcher.enqueue(task(id));
        dispatcher.shutdown().await;

        assert_eq!(store.get(id).unwrap().unwrap().status, WatchStatus::Error);
        assert_eq!(dispatcher.stats().permanent_failures(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_stays_pending() {
        let (store, id) = store_with_request();
        let mailer = Arc::new(RecordingMailer::new(SendOutcome::TransientFailure("timeout".into())));
        let dispatcher = NotificationDispatcher::start(store.clone(), mailer, 1, 8);

        dispatcher.enqueue(task(id));
        dispatcher.shutdown().await;

        assert_eq!(store.get(id).unwrap().unwrap().status, WatchStatus::Pending);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_rejected_while_in_flight() {
        let (store, id) = store_with_request();
        let mailer = Arc::new(RecordingMailer::new(SendOutcome::Sent).with_delay(Duration::from_millis(200)));
        let dispatcher = NotificationDispatcher::start(store, mailer.clone(), 1, 8);

        assert_eq!(dispatcher.enqueue(task(id)), EnqueueOutcome::Queued);
        assert!(dispatcher.is_in_flight(id));
        assert_eq!(dispatcher.enqueue(task(id)), EnqueueOutcome::AlreadyInFlight);
        dispatcher.shutdown().await;

        assert_eq!(mailer.sent_to().len(), 1);
    }

    #[tokio::test]
    async fn test_finished_request_is_not_sent_again() {
        let (store, id) = store_with_request();
        let mailer = Arc::new(RecordingMailer::new(SendOutcome::Sent).with_delay(Duration::from_millis(100)));
        let dispatcher = NotificationDispatcher::start(store.clone(), mailer.clone(), 1, 8);

        // First send completes and releases the id.
        assert_eq!(dispatcher.enqueue(task(id)), EnqueueOutcome::Queued);
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.is_in_flight(id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().status, WatchStatus::Notified);

        // A cycle that listed the row before it was notified queues it again.
        assert_eq!(dispatcher.enqueue(task(id)), EnqueueOutcome::Queued);
        dispatcher.shutdown().await;

        assert_eq!(mailer.sent_to(), vec!["alice@x.com".to_string()]);
        assert_eq!(dispatcher.stats().skipped(), 1);
        assert_eq!(dispatcher.stats().sent(), 1);
    }

    #[tokio::test]
    async fn test_errored_request_is_not_sent() {
        let (store, id) = store_with_request();
        store
            .bulk_update_status(&StatusUpdate {
                errored: vec![id],
                ..Default::default()
            })
            .unwrap();
        let mailer = Arc::new(RecordingMailer::new(SendOutcome::Sent));
        let dispatcher = NotificationDispatcher::start(store.clone(), mailer.clone(), 1, 8);

        dispatcher.enqueue(task(id));
        dispatcher.shutdown().await;

        assert!(mailer.sent_to().is_empty());
        assert_eq!(store.get(id).unwrap().unwrap().status, WatchStatus::Error);
    }

    #[tokio::test]
    async fn test_panicking_mailer_does_not_kill_worker() {
        let (store, id) = store_with_request();
        let mailer = Arc::new(RecordingMailer::new(SendOutcome::Sent).panic_on("boom@x.com"));
        let dispatcher = NotificationDispatcher::start(store.clone(), mailer, 1, 8);

        let boom_id = store
            .upsert(&NewWatch {
                email: "boom@x.com".into(),
                term_id: "2241".into(),
                course_code: "COMPSCI 1JC3".into(),
                section_key: "LEC_1_C01".into(),
                section_display: "LEC C01".into(),
            })
            .unwrap()
            .id();
        let mut bad = task(boom_id);
        bad.email = "boom@x.com".into();
        dispatcher.enqueue(bad);
        dispatcher.enqueue(task(id));
        dispatcher.shutdown().await;

        assert_eq!(dispatcher.stats().panics(), 1);
        assert_eq!(store.get(boom_id).unwrap().unwrap().status, WatchStatus::Pending);
        assert_eq!(store.get(id).unwrap().unwrap().status, WatchStatus::Notified);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_closed() {
        let (store, id) = store_with_request();
        let dispatcher = NotificationDispatcher::start(store, Arc::new(RecordingMailer::new(SendOutcome::Sent)), 1, 1);
        dispatcher.shutdown().await;

        assert_eq!(dispatcher.enqueue(task(id)), EnqueueOutcome::Closed);
        assert!(!dispatcher.is_in_flight(id));
    }
}
