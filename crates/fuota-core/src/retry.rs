//! # Retry Scheduling
//!
//! Timestamp-driven retry bookkeeping for provisioning sessions.
//!
//! ## Separation of Concerns
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  RetrySchedule  (stored with every session row)                        │
//! │  ├── retry_after          earliest time the row is due again           │
//! │  ├── retry_count          attempts made so far                         │
//! │  └── retry_interval_secs  interval used for the last reschedule        │
//! │                                                                         │
//! │  RetryPolicy    (chosen by the step executor, never stored)            │
//! │  └── next_interval(attempt, previous) → Duration                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store records whatever schedule it is handed; nothing here runs timers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Decides how long to wait before the next attempt.
pub trait RetryPolicy: Send + Sync {
    /// Interval before attempt number `attempt` (1-based), given the
    /// interval used for the previous attempt.
    fn next_interval(&self, attempt: i32, previous: Duration) -> Duration;
}

/// Doubling backoff, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: i32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        ExponentialBackoff {
            initial,
            max,
            multiplier: 2,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff::new(Duration::seconds(60), Duration::hours(1))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_interval(&self, attempt: i32, previous: Duration) -> Duration {
        if attempt <= 1 || previous <= Duration::zero() {
            return self.initial.min(self.max);
        }
        previous
            .checked_mul(self.multiplier)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Fixed interval between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedInterval(pub Duration);

impl RetryPolicy for FixedInterval {
    fn next_interval(&self, _attempt: i32, _previous: Duration) -> Duration {
        self.0
    }
}

/// Retry columns shared by every provisioning-session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct RetrySchedule {
    /// Earliest time the row is eligible for another attempt.
    pub retry_after: DateTime<Utc>,
    /// Attempts made so far.
    pub retry_count: i32,
    /// Interval used for the most recent reschedule, in seconds.
    pub retry_interval_secs: i64,
}

impl RetrySchedule {
    /// A fresh schedule: no attempts yet, due at `retry_after`.
    pub fn new(retry_after: DateTime<Utc>, retry_interval: Duration) -> Self {
        RetrySchedule {
            retry_after,
            retry_count: 0,
            retry_interval_secs: retry_interval.num_seconds(),
        }
    }

    /// Due immediately, with no interval recorded.
    pub fn due_now() -> Self {
        RetrySchedule::new(Utc::now(), Duration::zero())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::seconds(self.retry_interval_secs)
    }

    /// True once `now` has reached `retry_after`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_after <= now
    }

    /// True when no further attempt is allowed under `max_retry_count`.
    pub fn is_exhausted(&self, max_retry_count: i32) -> bool {
        self.retry_count >= max_retry_count
    }

    /// Records one more attempt and pushes `retry_after` out by the
    /// policy's next interval.
    pub fn schedule_retry(&mut self, policy: &dyn RetryPolicy, now: DateTime<Utc>) {
        self.retry_count += 1;
        let interval = policy.next_interval(self.retry_count, self.retry_interval());
        self.retry_interval_secs = interval.num_seconds();
        self.retry_after = now + interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let policy = ExponentialBackoff::new(Duration::seconds(10), Duration::seconds(60));
        assert_eq!(policy.next_interval(1, Duration::zero()), Duration::seconds(10));
        assert_eq!(policy.next_interval(2, Duration::seconds(10)), Duration::seconds(20));
        assert_eq!(policy.next_interval(3, Duration::seconds(40)), Duration::seconds(60));
    }

    #[test]
    fn test_schedule_retry_advances_due_time() {
        let now = Utc::now();
        let policy = ExponentialBackoff::new(Duration::seconds(10), Duration::seconds(60));
        let mut schedule = RetrySchedule::new(now, Duration::zero());
        assert!(schedule.is_due(now));

        schedule.schedule_retry(&policy, now);
        assert_eq!(schedule.retry_count, 1);
        assert_eq!(schedule.retry_after, now + Duration::seconds(10));
        assert!(!schedule.is_due(now));

        schedule.schedule_retry(&policy, now);
        assert_eq!(schedule.retry_count, 2);
        assert_eq!(schedule.retry_interval_secs, 20);
        assert!(schedule.is_exhausted(2));
        assert!(!schedule.is_exhausted(3));
    }

    #[test]
    fn test_fixed_interval() {
        let now = Utc::now();
        let mut schedule = RetrySchedule::new(now, Duration::zero());
        schedule.schedule_retry(&FixedInterval(Duration::minutes(5)), now);
        assert_eq!(schedule.retry_after, now + Duration::minutes(5));
    }
}
