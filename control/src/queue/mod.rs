//! Reconcile queue
//!
//! A deduplicating work queue of Service keys plus the retry rate limiting
//! the controller applies to failed keys.

pub mod rate_limiter;
pub mod work_queue;

pub use rate_limiter::{ControllerRateLimiter, ExponentialBackoff, TokenBucket};
pub use work_queue::{RateLimitingQueue, WorkQueue};
