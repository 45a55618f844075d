//! Double-check decision for cache refreshes.
//!
//! A change is only committed after two consecutive fetches agree with each
//! other. An agreed empty result never replaces a non-empty cache entry.

use crate::types::{CourseCode, TermInfo};
use std::collections::BTreeSet;

/// A fetched snapshot that can be compared against the cached one.
pub trait Confirmable {
    type Fingerprint: PartialEq;

    /// Order-insensitive identity of the snapshot.
    fn fingerprint(&self) -> Self::Fingerprint;

    fn is_empty(&self) -> bool;
}

impl Confirmable for Vec<TermInfo> {
    type Fingerprint = BTreeSet<(String, String)>;

    fn fingerprint(&self) -> Self::Fingerprint {
        self.iter().map(|t| (t.id.clone(), t.name.clone())).collect()
    }

    fn is_empty(&self) -> bool {
        <[TermInfo]>::is_empty(self)
    }
}

impl Confirmable for Vec<CourseCode> {
    type Fingerprint = Vec<CourseCode>;

    fn fingerprint(&self) -> Self::Fingerprint {
        let mut sorted = self.clone();
        sorted.sort();
        sorted
    }

    fn is_empty(&self) -> bool {
        <[CourseCode]>::is_empty(self)
    }
}

/// Outcome of comparing two fetches against the cached value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshDecision<T> {
    /// Both fetches agree with the cache
    Unchanged,
    /// Both fetches agree on a new value
    Commit(T),
    /// The two fetches disagree with each other
    Inconsistent,
    /// Both fetches came back empty while the cache holds data
    SuspectedOutage,
}

/// Returns true if `fetched` is the same as what is cached.
///
/// An absent cache entry never matches, not even an empty fetch.
pub fn matches_cached<T: Confirmable>(cached: Option<&T>, fetched: &T) -> bool {
    cached.is_some_and(|c| c.fingerprint() == fetched.fingerprint())
}

/// Decides what to do with a change seen by `first` and re-read as `second`.
pub fn confirm<T: Confirmable>(cached: Option<&T>, first: T, second: &T) -> RefreshDecision<T> {
    if first.fingerprint() != second.fingerprint() {
        return RefreshDecision::Inconsistent;
    }
    if matches_cached(cached, &first) {
        return RefreshDecision::Unchanged;
    }
    if first.is_empty() && cached.is_some_and(|c| !c.is_empty()) {
        return RefreshDecision::SuspectedOutage;
    }
    RefreshDecision::Commit(first)
}
