//! Error types for the watch-request store.

use thiserror::Error;

/// Errors returned by [`super::WatchStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite rejected the statement or the connection failed
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database directory could not be created
    #[error("Failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    /// A pending request for the same email, term and section already exists
    #[error("A pending watch request already exists (ID: {id})")]
    AlreadyPending { id: i64 },
}

impl StoreError {
    /// Returns true if retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
