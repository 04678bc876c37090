//! Retry rate limiting for the reconcile queue
//!
//! Two independent limiters decide when a failed key may be retried:
//! - Per-key exponential backoff (`base * 2^failures`, capped)
//! - A global token bucket bounding total retry throughput
//!
//! The effective delay is the larger of the two.
//!
//! Algorithm: https://en.wikipedia.org/wiki/Token_bucket

use crate::config::QueueConfig;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Safe Mutex lock helper that recovers from poisoning
#[inline]
fn safe_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex poisoned, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with reservations
///
/// Unlike a rejecting limiter, `reserve` always succeeds: the balance may go
/// negative and the caller is told how long to wait for its token.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum tokens (burst capacity)
    capacity: f64,
    /// Refill rate (tokens per second)
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a new token bucket
    ///
    /// # Arguments
    /// * `rate` - Tokens per second (e.g., 10.0 = 10 retries/sec)
    /// * `burst` - Maximum burst capacity (tokens)
    pub fn new(rate: f64, burst: u64) -> Self {
        let capacity = burst as f64;
        Self {
            capacity,
            refill_rate: rate,
            state: Mutex::new(BucketState {
                tokens: capacity, // Start with full bucket
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, returning how long the caller must wait for it
    pub fn reserve(&self) -> Duration {
        let mut state = safe_lock(&self.state);
        self.refill(&mut state);

        state.tokens -= 1.0;
        if state.tokens >= 0.0 || self.refill_rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.refill_rate)
        }
    }

    /// Get current token count (may be negative while reservations are outstanding)
    pub fn available_tokens(&self) -> f64 {
        let mut state = safe_lock(&self.state);
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        let tokens_to_add = elapsed.as_secs_f64() * self.refill_rate;

        if tokens_to_add > 0.0 {
            state.tokens = (state.tokens + tokens_to_add).min(self.capacity);
            state.last_refill = now;
        }
    }
}

/// Per-key exponential failure backoff
#[derive(Debug)]
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record one more failure for `key` and return its backoff
    pub fn when(&self, key: &K) -> Duration {
        let exp = {
            let mut failures = safe_lock(&self.failures);
            let count = failures.entry(key.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |backoff| backoff.min(self.max))
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        safe_lock(&self.failures).get(key).copied().unwrap_or(0)
    }

    pub fn forget(&self, key: &K) {
        safe_lock(&self.failures).remove(key);
    }
}

/// Combined limiter used by the reconcile queue
#[derive(Debug)]
pub struct ControllerRateLimiter<K> {
    backoff: ExponentialBackoff<K>,
    bucket: TokenBucket,
}

impl<K: Eq + Hash + Clone> ControllerRateLimiter<K> {
    pub fn new(backoff: ExponentialBackoff<K>, bucket: TokenBucket) -> Self {
        Self { backoff, bucket }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(
            ExponentialBackoff::new(config.base_delay(), config.max_delay()),
            TokenBucket::new(config.qps, config.burst),
        )
    }

    /// Delay before `key` may be retried
    pub fn when(&self, key: &K) -> Duration {
        let backoff = self.backoff.when(key);
        let throttle = self.bucket.reserve();
        backoff.max(throttle)
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.backoff.num_requeues(key)
    }

    pub fn forget(&self, key: &K) {
        self.backoff.forget(key);
    }
}

impl<K: Eq + Hash + Clone> Default for ControllerRateLimiter<K> {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}
