//! Per-(provider, model) token bucket.
//!
//! Keeps the aggregate request rate below provider limits no matter how
//! many workers are running. Buckets are shared through the throttle
//! registry; acquiring waits rather than failing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration, Instant};
use tracing::trace;

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_per_sec: refill_per_sec.max(0.01),
            state: Mutex::new(BucketState {
                tokens: capacity.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until the bucket can supply it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
                }
            };
            match wait {
                None => return,
                Some(duration) => {
                    trace!(?duration, "Token bucket exhausted, waiting");
                    sleep(duration).await;
                }
            }
        }
    }
}

/// Registry of buckets keyed by (provider, model).
#[derive(Default)]
pub struct ProviderThrottle {
    buckets: Mutex<HashMap<(String, String), Arc<TokenBucket>>>,
}

impl ProviderThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared bucket for one provider/model pair, created on first use
    /// with the given steady-state requests per second.
    pub fn bucket_for(
        &self,
        provider: &str,
        model: &str,
        requests_per_sec: f64,
    ) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            buckets
                .entry((provider.to_string(), model.to_string()))
                .or_insert_with(|| {
                    Arc::new(TokenBucket::new(requests_per_sec.max(1.0), requests_per_sec))
                }),
        )
    }
}
