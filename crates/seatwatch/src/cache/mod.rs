//! In-memory mirror of the upstream term and course catalogues.

pub mod refresh;

use crate::types::{CourseCode, TermInfo};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Thread-safe cache of terms and per-term course lists.
///
/// Terms and courses sit behind separate locks so a course refresh never
/// blocks a term read. Every accessor hands out an owned copy.
#[derive(Default)]
pub struct TermCache {
    terms: RwLock<Vec<TermInfo>>,
    courses: RwLock<HashMap<String, Vec<CourseCode>>>,
}

impl TermCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the cached terms.
    pub fn get_terms(&self) -> Vec<TermInfo> {
        read(&self.terms).clone()
    }

    /// Returns the cached term with the given id, if any.
    pub fn get_term(&self, term_id: &str) -> Option<TermInfo> {
        read(&self.terms).iter().find(|t| t.id == term_id).cloned()
    }

    pub fn has_term(&self, term_id: &str) -> bool {
        read(&self.terms).iter().any(|t| t.id == term_id)
    }

    /// Returns a copy of the course list for `term_id`.
    ///
    /// `None` means the term key is absent entirely (data not loaded), which
    /// is distinct from `Some(vec![])`.
    pub fn get_courses(&self, term_id: &str) -> Option<Vec<CourseCode>> {
        read(&self.courses).get(term_id).cloned()
    }

    /// Returns a copy of every cached course list.
    pub fn all_courses(&self) -> HashMap<String, Vec<CourseCode>> {
        read(&self.courses).clone()
    }

    /// Replaces the term list. Used by the update loop once a change is confirmed.
    pub fn replace_terms(&self, terms: Vec<TermInfo>) {
        *write(&self.terms) = terms;
    }

    /// Replaces all course lists. Used by the update loop once a change is confirmed.
    pub fn replace_courses(&self, courses: HashMap<String, Vec<CourseCode>>) {
        *write(&self.courses) = courses;
    }

    /// Gets cache statistics.
    pub fn stats(&self) -> CacheStats {
        let term_count = read(&self.terms).len();
        let courses = read(&self.courses);
        CacheStats {
            term_count,
            course_term_count: courses.len(),
            total_courses: courses.values().map(Vec::len).sum(),
        }
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub term_count: usize,
    pub course_term_count: usize,
    pub total_courses: usize,
}

// A panicking writer only ever swaps in a whole value, so poisoned data is still consistent.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
