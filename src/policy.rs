//! Eligibility, ordering and retry rules.
//!
//! Everything here is pure so it can be tested without a database. The lease
//! query in [`crate::lease`] implements the same ordering in SQL.

use crate::schema::{Job, JobState};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default delay before the first retry.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Default upper bound for any retry delay.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60 * 60);

/// Whether `job` may be leased at `now`.
pub fn is_eligible(job: &Job, now: DateTime<Utc>) -> bool {
    job.state == JobState::Pending && job.scheduled_at <= now
}

/// Sort key for eligible jobs: smaller keys are leased first.
pub fn priority_key(job: &Job) -> (i16, DateTime<Utc>, i64) {
    (job.priority, job.scheduled_at, job.id)
}

/// Exponential backoff: `base * 2^attempt`, never more than `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP)
    }
}

impl Backoff {
    /// Create a backoff. A `cap` smaller than `base` caps every delay at `cap`.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay applied after `attempt` failed attempts.
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return to `pending`, eligible again at `at`.
    Retry {
        /// The new `scheduled_at`
        at: DateTime<Utc>,
    },
    /// No attempts left, move to terminal `failed`.
    Discard,
}

/// Decide the fate of a job whose attempt number `attempt` just failed.
pub fn retry_decision(
    attempt: i32,
    max_attempts: i32,
    now: DateTime<Utc>,
    backoff: &Backoff,
) -> RetryDecision {
    if attempt >= max_attempts {
        return RetryDecision::Discard;
    }

    let delay = backoff.delay(u32::try_from(attempt).unwrap_or(0));
    let at = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    RetryDecision::Retry { at }
}
