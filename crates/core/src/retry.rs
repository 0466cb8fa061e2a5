//! Retry/backoff policy: pure decision logic for failed jobs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;
use crate::task::{FailureKind, TaskFailure};

/// Upper bound applied when the exponential delay overflows and no explicit
/// `max_delay` is configured.
const BACKOFF_CEILING: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Exponential backoff configuration.
///
/// The delay before retry `n` (the attempt count *after* the failure) is
/// `base_delay * exponent^n`, optionally capped by `max_delay`. With the
/// defaults (1s, 2) that is `2^n` seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub exponent: u32,
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            exponent: 2,
            max_delay: None,
        }
    }
}

/// Why a failed job will not be retried.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermanentReason {
    /// The executor classified the failure as non-retryable.
    NonRetryable,
    /// A retryable failure, but `max_attempts` has been reached.
    AttemptsExhausted,
}

/// Outcome of applying the policy to one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    Retry {
        attempt_count: u32,
        run_at: DateTime<Utc>,
        error_message: String,
    },
    Permanent {
        attempt_count: u32,
        error_message: String,
        reason: PermanentReason,
    },
}

impl FailureDecision {
    pub fn attempt_count(&self) -> u32 {
        match self {
            FailureDecision::Retry { attempt_count, .. }
            | FailureDecision::Permanent { attempt_count, .. } => *attempt_count,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, FailureDecision::Permanent { .. })
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, exponent: u32) -> Self {
        Self {
            base_delay,
            exponent,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay before the job becomes eligible again after reaching `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.unwrap_or(BACKOFF_CEILING);
        let delay = self
            .exponent
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(cap);
        delay.min(cap)
    }

    /// Decide what happens to `job` after `failure` occurred at `now`.
    pub fn decide(&self, job: &Job, failure: &TaskFailure, now: DateTime<Utc>) -> FailureDecision {
        let attempt_count = job.attempt_count.saturating_add(1);
        let error_message = failure.to_error_message();

        if failure.kind == FailureKind::NonRetryable {
            return FailureDecision::Permanent {
                attempt_count,
                error_message,
                reason: PermanentReason::NonRetryable,
            };
        }
        if attempt_count >= job.max_attempts {
            return FailureDecision::Permanent {
                attempt_count,
                error_message,
                reason: PermanentReason::AttemptsExhausted,
            };
        }

        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt_count))
            .unwrap_or(chrono::Duration::MAX);
        let run_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        FailureDecision::Retry {
            attempt_count,
            run_at,
            error_message,
        }
    }
}
