//! Pre-broadcast failure tracking and the progressive-retry gate
//! (spec.md §4.1 "Stage 3 — Progressive retry gate").

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transfer::Stage;

/// A pre-broadcast failure record for one order. Created on first failure;
/// updated on each subsequent one; deleted on success or on reset-timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub count: u32,
    pub last_error: String,
    pub stage: Stage,
    pub first_failure_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn first(stage: Stage, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self { count: 1, last_error: error.into(), stage, first_failure_at: at, last_attempt_at: at }
    }

    pub fn record_another(&mut self, stage: Stage, error: impl Into<String>, at: DateTime<Utc>) {
        self.count += 1;
        self.stage = stage;
        self.last_error = error.into();
        self.last_attempt_at = at;
    }

    /// Whether this record is old enough that it should be discarded and the
    /// order treated as never-failed (spec: "if the time since first failure
    /// exceeds one hour, discard the record").
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.first_failure_at) > chrono::Duration::hours(1)
    }
}

/// One of the four escalating retry tiers keyed by failure count, per
/// spec §4.1: `<10 -> (10, 5s)`, `<25 -> (25, 30s)`, `<50 -> (50, 60s)`,
/// else `(100, 5m)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTier {
    pub max_retries: u32,
    pub min_wait: Duration,
}

/// Thresholds at which a structured critical alert fires (spec §4.1).
pub const ALERT_THRESHOLDS: [u32; 3] = [10, 25, 50];

pub fn retry_tier(failure_count: u32) -> RetryTier {
    if failure_count < 10 {
        RetryTier { max_retries: 10, min_wait: Duration::from_secs(5) }
    } else if failure_count < 25 {
        RetryTier { max_retries: 25, min_wait: Duration::from_secs(30) }
    } else if failure_count < 50 {
        RetryTier { max_retries: 50, min_wait: Duration::from_secs(60) }
    } else {
        RetryTier { max_retries: 100, min_wait: Duration::from_secs(300) }
    }
}

/// Whether a failure record at this point in time should soft-fail with a
/// "backoff" outcome rather than be retried immediately.
pub fn should_back_off(record: &FailureRecord, now: DateTime<Utc>) -> bool {
    let tier = retry_tier(record.count);
    let since_last = now.signed_duration_since(record.last_attempt_at);
    since_last < chrono::Duration::from_std(tier.min_wait).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_boundaries() {
        assert_eq!(retry_tier(9).max_retries, 10);
        assert_eq!(retry_tier(9).min_wait, Duration::from_secs(5));
        assert_eq!(retry_tier(10).max_retries, 25);
        assert_eq!(retry_tier(10).min_wait, Duration::from_secs(30));
        assert_eq!(retry_tier(24).max_retries, 25);
        assert_eq!(retry_tier(25).max_retries, 50);
        assert_eq!(retry_tier(49).max_retries, 50);
        assert_eq!(retry_tier(50).max_retries, 100);
        assert_eq!(retry_tier(50).min_wait, Duration::from_secs(300));
    }

    #[test]
    fn stale_after_one_hour() {
        let start = Utc::now();
        let record = FailureRecord::first(Stage::Compose, "boom", start);
        assert!(!record.is_stale(start + chrono::Duration::minutes(59)));
        assert!(record.is_stale(start + chrono::Duration::minutes(61)));
    }

    #[test]
    fn backs_off_within_min_wait() {
        let start = Utc::now();
        let record = FailureRecord::first(Stage::Compose, "boom", start);
        assert!(should_back_off(&record, start + chrono::Duration::seconds(1)));
        assert!(!should_back_off(&record, start + chrono::Duration::seconds(6)));
    }
}
