use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HandlerError;

/// Configuration for retry backoff behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Growth factor applied per additional attempt.
    pub factor: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_delay_ms: u64,
    /// Ratio of jitter to add to delays (0.0 - 1.0).
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            factor: 2.0,
            max_delay_ms: 10_000,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy with tiny delays, for tests and local demos.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 1,
            factor: 1.0,
            max_delay_ms: 1,
            jitter_ratio: 0.0,
        }
    }
}

/// Computes the delay before a failed job becomes claimable again.
///
/// Formula: delay = min(max_delay, base * factor^(attempts-1))
///
/// # Arguments
/// * `attempts` - Attempts made so far, including the one that just failed
/// * `base_delay_ms` - Base delay, usually the policy's unless the job overrides it
/// * `policy` - The retry policy
pub fn compute_backoff_delay(
    attempts: u32,
    base_delay_ms: u64,
    policy: &RetryPolicy,
) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }

    let exp = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
    let scaled = (base_delay_ms as f64) * policy.factor.max(1.0).powi(exp);
    let capped = scaled.min(policy.max_delay_ms as f64);
    let clamped_ms = capped.max(0.0) as u64;

    Duration::from_millis(clamped_ms)
}

/// Adds up to `jitter_ratio` of random extra delay.
pub fn jittered_delay(delay: Duration, policy: &RetryPolicy) -> Duration {
    let ratio = policy.jitter_ratio.clamp(0.0, 1.0);
    if ratio == 0.0 || delay.is_zero() {
        return delay;
    }
    let extra = delay.as_secs_f64() * ratio * rand::random::<f64>();
    delay + Duration::from_secs_f64(extra)
}

/// Outcome of a failed attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Re-queue; the job may be claimed again after `delay`.
    Retry { delay: Duration },
    /// Terminal failure.
    Fail { exhausted: bool },
}

/// Decides between retry and terminal failure for a handler error.
///
/// - Non-retryable errors fail immediately
/// - Retryable errors retry while `attempts < max_attempts`
pub fn decide(
    error: &HandlerError,
    attempts: u32,
    max_attempts: u32,
    base_delay_ms: Option<u64>,
    policy: &RetryPolicy,
) -> RetryDecision {
    if !error.is_retryable() {
        return RetryDecision::Fail { exhausted: false };
    }
    if attempts >= max_attempts {
        return RetryDecision::Fail { exhausted: true };
    }

    let base = base_delay_ms.unwrap_or(policy.base_delay_ms);
    let delay = compute_backoff_delay(attempts, base, policy);
    RetryDecision::Retry {
        delay: jittered_delay(delay, policy),
    }
}
