//! Retry with exponential backoff and jitter.
//!
//! Transient failures back off exponentially with full jitter. Rate limits
//! honor the provider-advised delay and only start counting against the
//! attempt budget past a grace threshold. Invalid output is retried exactly
//! once with the strict-reminder prompt, then escalates to permanent.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts consumed by transient failures (and rate limits past the
    /// grace threshold) before escalating to permanent.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Rate-limit responses tolerated before they start consuming attempts.
    pub rate_limit_grace: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: rhizome_protocol::config::defaults::CHUNK_RETRY_LIMIT,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            rate_limit_grace: 3,
        }
    }
}

/// What the operation should know about the current try.
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// Set after an `InvalidOutput` failure: use the strict prompt variant.
    pub strict: bool,
}

/// Drive `op` until success, a permanent error, cancellation, or an
/// exhausted budget. Exhaustion escalates the last error to `Permanent`.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    is_cancelled: impl Fn() -> bool,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempts_used: u32 = 0;
    let mut rate_limits_seen: u32 = 0;
    let mut invalid_retried = false;
    let mut strict = false;

    loop {
        if is_cancelled() {
            return Err(ProviderError::Permanent(format!(
                "{op_name} aborted by cancellation"
            )));
        }

        let attempt = Attempt {
            number: attempts_used + 1,
            strict,
        };
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(ProviderError::Permanent(message)) => {
                return Err(ProviderError::Permanent(message));
            }
            Err(ProviderError::InvalidOutput(message)) => {
                if invalid_retried {
                    return Err(ProviderError::Permanent(format!(
                        "{op_name}: invalid output persisted after strict retry: {message}"
                    )));
                }
                warn!(op = op_name, %message, "Invalid output, retrying with strict reminder");
                invalid_retried = true;
                strict = true;
            }
            Err(ProviderError::RateLimited {
                message,
                retry_after,
            }) => {
                rate_limits_seen += 1;
                if rate_limits_seen > policy.rate_limit_grace {
                    attempts_used += 1;
                    if attempts_used >= policy.max_attempts {
                        return Err(ProviderError::Permanent(format!(
                            "{op_name}: rate limited past retry budget: {message}"
                        )));
                    }
                }
                let delay = retry_after.unwrap_or_else(|| backoff_delay(policy, attempts_used));
                debug!(op = op_name, ?delay, "Rate limited, waiting");
                tokio::time::sleep(delay).await;
            }
            Err(ProviderError::Transient(message)) => {
                attempts_used += 1;
                if attempts_used >= policy.max_attempts {
                    return Err(ProviderError::Permanent(format!(
                        "{op_name}: transient failure persisted after {} attempts: {message}",
                        policy.max_attempts
                    )));
                }
                let delay = backoff_delay(policy, attempts_used);
                debug!(op = op_name, attempt = attempts_used, ?delay, %message, "Transient failure, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Exponential backoff with full jitter, capped at `max_delay`.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let cap = exp.min(policy.max_delay);
    let jittered_ms = rand::thread_rng().gen_range(0..=cap.as_millis().max(1) as u64);
    Duration::from_millis(jittered_ms)
}
