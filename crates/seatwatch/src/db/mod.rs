/// Durable storage for watch requests
mod error;

pub use error::StoreError;

use crate::types::{WatchRequest, WatchStatus};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = include_str!("../../sql/init_watch_requests.sql");

const SELECT_COLUMNS: &str = "id, email, term_id, course_code, section_key, section_display, \
                              status, created_at, last_checked_at, notified_at";

/// Fields supplied when creating or reactivating a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWatch {
    pub email: String,
    pub term_id: String,
    pub course_code: String,
    pub section_key: String,
    pub section_display: String,
}

/// Successful result of [`WatchStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created { id: i64 },
    Reactivated { id: i64 },
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            UpsertOutcome::Created { id } | UpsertOutcome::Reactivated { id } => *id,
        }
    }

    /// User-facing confirmation text.
    pub fn message(&self, watch: &NewWatch) -> String {
        match self {
            UpsertOutcome::Created { id } => format!(
                "Successfully added new watch request (ID: {id}) for {} {}.",
                watch.course_code, watch.section_display
            ),
            UpsertOutcome::Reactivated { id } => format!(
                "Successfully reactivated your previous watch request (ID: {id}) for {} {}.",
                watch.course_code, watch.section_display
            ),
        }
    }
}

/// Status transitions collected over one check cycle or one send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub notified: Vec<i64>,
    pub errored: Vec<i64>,
    /// Still pending; only `last_checked_at` is touched
    pub checked: Vec<i64>,
}

impl StatusUpdate {
    pub fn is_empty(&self) -> bool {
        self.notified.is_empty() && self.errored.is_empty() && self.checked.is_empty()
    }
}

/// Rows changed by [`WatchStore::bulk_update_status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateCounts {
    pub notified: usize,
    pub errored: usize,
    pub checked: usize,
}

pub struct WatchStore {
    db: Mutex<Connection>,
}

impl WatchStore {
    /// Opens (creating if needed) the database file and initializes the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened watch request database");
        Self::with_connection(conn)
    }

    /// In-memory store, mostly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // Statements either commit or roll back as a unit, so a poisoned guard is still usable.
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a pending watch, or reactivates a finished one for the same target.
    ///
    /// Runs inside an immediate transaction so two concurrent callers for the
    /// same `(email, term_id, section_key)` cannot both see "no row". The
    /// unique index backs this up at the storage level.
    pub fn upsert(&self, watch: &NewWatch) -> Result<UpsertOutcome, StoreError> {
        let mut db = self.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(i64, WatchStatus)> = tx
            .query_row(
                "SELECT id, status FROM watch_requests
                 WHERE email = ?1 AND term_id = ?2 AND section_key = ?3",
                params![watch.email, watch.term_id, watch.section_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            Some((id, WatchStatus::Pending)) => {
                debug!(request_id = id, "Upsert blocked, request already pending");
                return Err(StoreError::AlreadyPending { id });
            }
            Some((id, previous)) => {
                tx.execute(
                    "UPDATE watch_requests
                     SET status = ?1, notified_at = NULL, course_code = ?2, section_display = ?3
                     WHERE id = ?4",
                    params![WatchStatus::Pending, watch.course_code, watch.section_display, id],
                )?;
                info!(request_id = id, previous = %previous, "Reactivated watch request");
                UpsertOutcome::Reactivated { id }
            }
            None => {
                tx.execute(
                    "INSERT INTO watch_requests
                        (email, term_id, course_code, section_key, section_display, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        watch.email,
                        watch.term_id,
                        watch.course_code,
                        watch.section_key,
                        watch.section_display,
                        WatchStatus::Pending,
                        Utc::now(),
                    ],
                )?;
                let id = tx.last_insert_rowid();
                info!(request_id = id, term_id = %watch.term_id, "Created watch request");
                UpsertOutcome::Created { id }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Lists every pending request, oldest first
    pub fn list_pending(&self) -> Result<Vec<WatchRequest>, StoreError> {
        let db = self.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM watch_requests WHERE status = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([WatchStatus::Pending], read_request)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get(&self, id: i64) -> Result<Option<WatchRequest>, StoreError> {
        let db = self.lock();
        let request = db
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM watch_requests WHERE id = ?1"),
                [id],
                read_request,
            )
            .optional()?;
        Ok(request)
    }

    /// Applies a batch of status transitions in a single transaction.
    ///
    /// Only rows that are still pending are touched, so a row finalized by a
    /// concurrent path is never moved again. Ids listed as notified or errored
    /// are excluded from the `checked` set.
    pub fn bulk_update_status(&self, update: &StatusUpdate) -> Result<UpdateCounts, StoreError> {
        if update.is_empty() {
            return Ok(UpdateCounts::default());
        }

        let now: DateTime<Utc> = Utc::now();
        let mut db = self.lock();
        let tx = db.transaction()?;
        let mut counts = UpdateCounts::default();

        {
            let mut notify = tx.prepare(
                "UPDATE watch_requests
                 SET status = ?1, notified_at = ?2, last_checked_at = ?2
                 WHERE id = ?3 AND status = ?4",
            )?;
            for id in &update.notified {
                counts.notified +=
                    notify.execute(params![WatchStatus::Notified, now, id, WatchStatus::Pending])?;
            }

            let mut fail = tx.prepare(
                "UPDATE watch_requests
                 SET status = ?1, last_checked_at = ?2
                 WHERE id = ?3 AND status = ?4",
            )?;
            for id in &update.errored {
                counts.errored +=
                    fail.execute(params![WatchStatus::Error, now, id, WatchStatus::Pending])?;
            }

            let finalized: HashSet<i64> = update
                .notified
                .iter()
                .chain(update.errored.iter())
                .copied()
                .collect();
            let mut touch = tx.prepare(
                "UPDATE watch_requests SET last_checked_at = ?1 WHERE id = ?2 AND status = ?3",
            )?;
            for id in update.checked.iter().filter(|id| !finalized.contains(*id)) {
                counts.checked += touch.execute(params![now, id, WatchStatus::Pending])?;
            }
        }

        tx.commit()?;

        let requested = update.notified.len() + update.errored.len();
        if counts.notified + counts.errored < requested {
            warn!(
                requested,
                applied = counts.notified + counts.errored,
                "Some status transitions skipped, rows were no longer pending"
            );
        }
        debug!(
            notified = counts.notified,
            errored = counts.errored,
            checked = counts.checked,
            "Applied status updates"
        );
        Ok(counts)
    }

    /// Runs a trivial query to confirm the connection works
    pub fn check_health(&self) -> bool {
        let db = self.lock();
        match db.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                false
            }
        }
    }
}

fn read_request(row: &Row<'_>) -> rusqlite::Result<WatchRequest> {
    Ok(WatchRequest {
        id: row.get(0)?,
        email: row.get(1)?,
        term_id: row.get(2)?,
        course_code: row.get(3)?,
        section_key: row.get(4)?,
        section_display: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
        last_checked_at: row.get(8)?,
        notified_at: row.get(9)?,
    })
}

impl ToSql for WatchStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for WatchStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}
