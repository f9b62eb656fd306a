//! Retention decisions.
//!
//! Pure: takes the prefixes found in storage and the current time, returns
//! which backups are past the retention window. Deleting them is the caller's
//! job.

use chrono::NaiveDateTime;

use crate::timestamp::BackupTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
}

impl RetentionPolicy {
    pub fn new(retention_days: u32) -> Self {
        Self { retention_days }
    }

    /// Whole days from `timestamp` to `now`, truncated. Negative for backups
    /// dated in the future.
    pub fn age_days(timestamp: &BackupTimestamp, now: NaiveDateTime) -> i64 {
        (now - timestamp.datetime()).num_days()
    }

    pub fn is_expired(&self, timestamp: &BackupTimestamp, now: NaiveDateTime) -> bool {
        Self::age_days(timestamp, now) > i64::from(self.retention_days)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionOutcome {
    /// Backups to purge, oldest first
    pub expired: Vec<BackupTimestamp>,

    /// Backups inside the window, oldest first
    pub kept: Vec<BackupTimestamp>,

    /// Entries that are not timestamps; never deleted
    pub malformed: Vec<String>,
}

/// Split `entries` into expired, kept and malformed.
pub fn expired<S: AsRef<str>>(
    entries: &[S],
    policy: RetentionPolicy,
    now: NaiveDateTime,
) -> RetentionOutcome {
    let mut outcome = RetentionOutcome::default();

    for entry in entries {
        let raw = entry.as_ref().trim_end_matches('/');
        match BackupTimestamp::parse(raw) {
            Some(ts) if policy.is_expired(&ts, now) => outcome.expired.push(ts),
            Some(ts) => outcome.kept.push(ts),
            None => outcome.malformed.push(raw.to_string()),
        }
    }

    outcome.expired.sort();
    outcome.expired.dedup();
    outcome.kept.sort();
    outcome.kept.dedup();
    outcome
}
