//! Retry policy: what happens to a job after an attempt.

use crate::dispatch::Outcome;
use crate::eligibility::SkipReason;
use crate::errors::DispatchError;
use std::time::Duration;

/// Attempts a job gets in total: the first one plus three retries.
pub const MAX_ATTEMPTS: u32 = 4;

const BASE_DELAY: Duration = Duration::from_secs(60);
const MAX_DELAY: Duration = Duration::from_secs(15 * 60);

/// Delay before the attempt following failed attempt number `attempt` (1-based).
///
/// `min(60s * 3^(attempt - 1), 15m)`: 1m, 3m, 9m, then capped at 15m.
pub fn backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    3u32.checked_pow(exponent)
        .and_then(|factor| BASE_DELAY.checked_mul(factor))
        .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
}

/// Where a job goes once an attempt has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// The message was handed to the carrier.
    Succeeded {
        /// Delivery log record that is now `sent`.
        record_id: i64,
    },
    /// Vetoed by a business rule. Not an error, never retried.
    Skipped(SkipReason),
    /// Try again after `delay`.
    Retrying {
        /// How long the job stays invisible.
        delay: Duration,
        /// Error of this attempt.
        error: String,
    },
    /// Retry budget exhausted; the delivery log record stays `failed`.
    FailedTerminal {
        /// Error of the last attempt.
        error: String,
    },
    /// Contract error: retrying cannot fix the input.
    Rejected {
        /// What was wrong.
        error: String,
    },
}

/// Decide the next state for a job whose attempt number `attempt` produced `result`.
pub fn next_state(attempt: u32, result: &Result<Outcome, DispatchError>) -> JobState {
    match result {
        Ok(Outcome::Sent { record_id }) => JobState::Succeeded {
            record_id: *record_id,
        },
        Ok(Outcome::Skipped(reason)) => JobState::Skipped(*reason),
        Err(error) if !error.is_retryable() => JobState::Rejected {
            error: error.to_string(),
        },
        Err(error) if attempt >= MAX_ATTEMPTS => JobState::FailedTerminal {
            error: error.to_string(),
        },
        Err(error) => JobState::Retrying {
            delay: backoff(attempt),
            error: error.to_string(),
        },
    }
}
