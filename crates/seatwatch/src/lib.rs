//! Seat-availability watcher for a university timetable.
//!
//! Subscribers register a watch on a full section; a background loop polls
//! live seat counts and emails each subscriber once the section opens. Term
//! and course lists are cached and refreshed with a double-checked fetch so a
//! flaky upstream never wipes the cache.
//!
//! The upstream timetable and the mail transport are supplied by the embedding
//! application through [`TimetableSource`] and [`Mailer`].

pub mod cache;
pub mod checker;
pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod notify;
pub mod server;
pub mod service;
pub mod source;
pub mod types;
pub mod updater;
pub mod watch;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::AppConfig;
pub use db::{StoreError, WatchStore};
pub use errors::WatchError;
pub use notify::{Mailer, NotificationContext, RenderedEmail, Renderer, SendOutcome};
pub use service::{Collaborators, HealthReport, HealthStatus, SeatWatch};
pub use source::{FetchError, TimetableSource};
pub use types::*;
pub use watch::WatchCreated;
