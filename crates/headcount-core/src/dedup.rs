//! Per-subject cooldown between attendance records.
//!
//! Process-local and never persisted: a restart forgets every subject. Owned
//! by the pipeline consumer, so it carries no synchronization.

use crate::types::SubjectKey;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct DedupLimiter {
    last_recorded: HashMap<SubjectKey, DateTime<Utc>>,
}

impl DedupLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `key` was never recorded or its last record is at least
    /// `interval` before `now`. An observation older than the last record
    /// (clock step backwards) is suppressed.
    pub fn should_record(&self, key: SubjectKey, now: DateTime<Utc>, interval: Duration) -> bool {
        let Some(last) = self.last_recorded.get(&key) else {
            return true;
        };
        match (now - *last).to_std() {
            Ok(elapsed) => elapsed >= interval,
            Err(_) => false,
        }
    }

    /// Call right after the attendance write for `key` succeeded.
    ///
    /// The stored time never moves backwards.
    pub fn mark_recorded(&mut self, key: SubjectKey, now: DateTime<Utc>) {
        self.last_recorded
            .entry(key)
            .and_modify(|last| *last = (*last).max(now))
            .or_insert(now);
    }

    pub fn last_recorded(&self, key: SubjectKey) -> Option<DateTime<Utc>> {
        self.last_recorded.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.last_recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_recorded.is_empty()
    }
}
