//! The retry/backoff controller: classifies write failures and schedules
//! re-delivery, dead-lettering, or pipeline abort.

use std::time::Duration;

use rand::Rng;
use riffle_errors::WriteErrorKind;
use serde::{Deserialize, Serialize};

/// Shape of the retry delay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicyKind {
    Fixed,
    Exponential,
}

/// Per-pipeline retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub kind: RetryPolicyKind,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Each delay is multiplied by `1 + U[-j, j]`.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            kind: RetryPolicyKind::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_fraction: 0.1,
        }
    }
}

/// What to do with a failed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-deliver to the sink after this delay, with upsert semantics.
    RetryAfter(Duration),
    /// Give up and append to the pipeline's dead-letter queue.
    DeadLetter,
    /// Stop the pipeline until operator intervention.
    Abort,
}

/// The delay before retry number `attempt` (1-based: the first retry is
/// attempt 1).
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let raw = match policy.kind {
        RetryPolicyKind::Fixed => policy.base_delay,
        RetryPolicyKind::Exponential => {
            let exp = attempt.saturating_sub(1).min(32);
            policy
                .base_delay
                .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
                .min(policy.max_delay)
        }
    };
    if policy.jitter_fraction <= 0.0 {
        return raw;
    }
    let j = policy.jitter_fraction;
    let factor = 1.0 + rand::rng().random_range(-j..=j);
    raw.mul_f64(factor.max(0.0))
}

/// Decide the fate of a write that failed with `kind` on delivery attempt
/// `attempt` (1-based).
///
/// `NotFound` never reaches this table: a not-found delete is a successful
/// write and is settled by the caller.
pub fn decide(
    policy: &RetryPolicy,
    max_retries: u32,
    attempt: u32,
    kind: WriteErrorKind,
) -> RetryDecision {
    match kind {
        WriteErrorKind::Fatal => RetryDecision::Abort,
        // Structural mismatches do not heal with time.
        WriteErrorKind::SchemaMismatch => RetryDecision::DeadLetter,
        WriteErrorKind::Transient | WriteErrorKind::Conflict | WriteErrorKind::NotFound => {
            if attempt > max_retries {
                RetryDecision::DeadLetter
            } else {
                RetryDecision::RetryAfter(compute_backoff(policy, attempt))
            }
        }
    }
}
