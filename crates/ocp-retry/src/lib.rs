//! ocp-retry
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Deterministic, jitter-free retry/backoff engine (component C8). Given an
//! async operation that yields an HTTP-shaped or network-shaped attempt
//! outcome, [`run_with_retry`] drives it through a bounded number of
//! attempts, sleeping a precomputed backoff between retryable failures, and
//! returns the full attempt log alongside a stable [`OutcomeCode`].

use ocp_error::OutcomeCode;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry/backoff configuration for one delivery attempt sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// If `false`, [`run_with_retry`] makes exactly one attempt.
    pub retry_enabled: bool,
    /// Upper bound on attempts, inclusive. Clamped to at least 1.
    pub max_attempts: u32,
    /// HTTP status codes that trigger a retry (subject to `max_attempts`).
    pub retry_on_status: Vec<u16>,
    /// Base backoff in milliseconds; `0` disables sleeping between attempts.
    pub base_backoff_ms: u64,
    /// Upper bound on any single backoff interval.
    pub max_backoff_ms: u64,
}

/// Per-attempt classification, mirroring §4.8's decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    /// A 2xx response was received; the sequence stops here.
    Delivered,
    /// A retryable condition was observed and another attempt will follow.
    RetryableFail,
    /// A terminal, non-retryable condition; the sequence stops here.
    NonRetryableFail,
}

/// One row of the attempt log returned by [`run_with_retry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Classification of this attempt.
    pub status: AttemptStatus,
    /// HTTP status code received, if this was an HTTP-shaped attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Transport-level error classification, if this was a network failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Backoff planned *before* the next attempt; `0` on the final attempt.
    pub planned_backoff_ms: u64,
}

/// What one attempt of the underlying operation produced.
pub enum AttemptOutcome<R> {
    /// An HTTP-shaped response was received (2xx or otherwise).
    Http {
        /// The response status code.
        status: u16,
        /// The full response value, returned to the caller on completion.
        response: R,
    },
    /// A transport-level (non-HTTP) failure occurred.
    Network {
        /// Human-readable classification of the failure.
        error: String,
    },
}

/// The full result of [`run_with_retry`]: the final response (if any HTTP
/// attempt was made), the attempt log, and a terminal [`OutcomeCode`].
pub struct RetryOutcome<R> {
    /// The response of the last HTTP-shaped attempt, if any.
    pub result: Option<R>,
    /// Ordered log of every attempt made.
    pub attempts: Vec<AttemptRecord>,
    /// Stable terminal outcome classification.
    pub outcome_code: OutcomeCode,
    /// Human-readable detail of the last network error, if any.
    pub last_error: Option<String>,
}

/// Deterministic backoff schedule: `min(max_backoff_ms, base_backoff_ms *
/// 2^(attempt-1))`, or `0` when `base_backoff_ms` is `0`. No jitter.
#[must_use]
pub fn backoff_for_attempt(policy: &RetryPolicy, attempt: u32) -> u64 {
    if policy.base_backoff_ms == 0 {
        return 0;
    }
    let exponent = attempt.saturating_sub(1).min(63);
    let scaled = policy.base_backoff_ms.saturating_mul(1u64 << exponent);
    scaled.min(policy.max_backoff_ms)
}

/// Drive `operation` through up to `policy.max_attempts` attempts.
///
/// `operation` is invoked with the 1-based attempt number and must produce
/// an [`AttemptOutcome`]. A 2xx HTTP response stops the sequence
/// immediately. A retryable HTTP status or network failure sleeps for
/// [`backoff_for_attempt`] and retries, provided attempts remain and
/// `policy.retry_enabled`. Any other outcome is terminal.
pub async fn run_with_retry<F, Fut, R>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<R>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AttemptOutcome<R>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = Vec::new();

    for attempt in 1..=max_attempts {
        match operation(attempt).await {
            AttemptOutcome::Http { status, response } => {
                if (200..300).contains(&status) {
                    attempts.push(AttemptRecord {
                        attempt,
                        status: AttemptStatus::Delivered,
                        http_status: Some(status),
                        error_code: None,
                        planned_backoff_ms: 0,
                    });
                    return RetryOutcome {
                        result: Some(response),
                        attempts,
                        outcome_code: OutcomeCode::Delivered,
                        last_error: None,
                    };
                }

                let attempts_remain = attempt < max_attempts;
                let is_retryable_status = policy.retry_on_status.contains(&status);

                if policy.retry_enabled && is_retryable_status && attempts_remain {
                    let backoff = backoff_for_attempt(policy, attempt);
                    attempts.push(AttemptRecord {
                        attempt,
                        status: AttemptStatus::RetryableFail,
                        http_status: Some(status),
                        error_code: None,
                        planned_backoff_ms: backoff,
                    });
                    if backoff > 0 {
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                    continue;
                }

                attempts.push(AttemptRecord {
                    attempt,
                    status: AttemptStatus::NonRetryableFail,
                    http_status: Some(status),
                    error_code: None,
                    planned_backoff_ms: 0,
                });
                let outcome_code = if policy.retry_enabled && is_retryable_status {
                    OutcomeCode::RetryExhausted
                } else {
                    OutcomeCode::NonRetryableHttpStatus
                };
                return RetryOutcome {
                    result: Some(response),
                    attempts,
                    outcome_code,
                    last_error: None,
                };
            }
            AttemptOutcome::Network { error } => {
                let attempts_remain = attempt < max_attempts;
                if policy.retry_enabled && attempts_remain {
                    let backoff = backoff_for_attempt(policy, attempt);
                    attempts.push(AttemptRecord {
                        attempt,
                        status: AttemptStatus::RetryableFail,
                        http_status: None,
                        error_code: Some("NETWORK".to_string()),
                        planned_backoff_ms: backoff,
                    });
                    if backoff > 0 {
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                    continue;
                }
                attempts.push(AttemptRecord {
                    attempt,
                    status: AttemptStatus::NonRetryableFail,
                    http_status: None,
                    error_code: Some("NETWORK".to_string()),
                    planned_backoff_ms: 0,
                });
                return RetryOutcome {
                    result: None,
                    attempts,
                    outcome_code: OutcomeCode::NetworkError,
                    last_error: Some(error),
                };
            }
        }
    }

    unreachable!("every branch above returns before attempts are exhausted")
}
