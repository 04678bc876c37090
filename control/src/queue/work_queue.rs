//! Deduplicating work queue
//!
//! Guarantees that a key is never handed to two workers at once:
//! - `add` of a pending key is a no-op
//! - `add` of an in-flight key marks it dirty; `done` re-queues it
//! - `get` waits for work and returns `None` once the queue is shut down

use crate::apis::metrics::{record_queue_retry, set_queue_depth};
use crate::queue::rate_limiter::ControllerRateLimiter;
use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Safe Mutex lock helper that recovers from poisoning
#[inline]
fn safe_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex poisoned, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

#[derive(Debug)]
struct QueueState<K> {
    /// Keys ready to be handed out, in insertion order
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while in flight)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    shutting_down: bool,
}

#[derive(Debug)]
struct Shared<K> {
    state: Mutex<QueueState<K>>,
    work_available: Notify,
}

/// Deduplicating FIFO of keys shared by all workers
///
/// Cloning is cheap and yields a handle to the same queue.
#[derive(Debug)]
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                work_available: Notify::new(),
            }),
        }
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: K) {
        let mut state = safe_lock(&self.shared.state);
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(key.clone()) {
            // Already pending
            return;
        }
        if state.processing.contains(&key) {
            // Re-queued by `done`
            return;
        }

        state.queue.push_back(key);
        set_queue_depth(state.queue.len());
        self.shared.work_available.notify_one();
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue is shutting down, even if keys are still
    /// pending.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Registered before inspecting the state so a concurrent `add`
            // or `shut_down` cannot slip between the check and the wait.
            let notified = self.shared.work_available.notified();
            {
                let mut state = safe_lock(&self.shared.state);
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    set_queue_depth(state.queue.len());
                    if !state.queue.is_empty() {
                        // Pass the wakeup on to another idle worker
                        self.shared.work_available.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as processed, re-queuing it if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = safe_lock(&self.shared.state);
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            set_queue_depth(state.queue.len());
            self.shared.work_available.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        safe_lock(&self.shared.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and release every waiting `get`
    pub fn shut_down(&self) {
        {
            let mut state = safe_lock(&self.shared.state);
            state.shutting_down = true;
        }
        self.shared.work_available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        safe_lock(&self.shared.state).shutting_down
    }
}

/// Work queue with per-key retry accounting
#[derive(Debug)]
pub struct RateLimitingQueue<K> {
    queue: WorkQueue<K>,
    limiter: Arc<ControllerRateLimiter<K>>,
}

impl<K> Clone for RateLimitingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(limiter: ControllerRateLimiter<K>) -> Self {
        Self {
            queue: WorkQueue::new(),
            limiter: Arc::new(limiter),
        }
    }

    pub fn add(&self, key: K) {
        self.queue.add(key);
    }

    pub async fn get(&self) -> Option<K> {
        self.queue.get().await
    }

    pub fn done(&self, key: &K) {
        self.queue.done(key);
    }

    pub fn add_after(&self, key: K, delay: Duration) {
        self.queue.add_after(key, delay);
    }

    /// Re-add `key` after its backoff delay, counting one more attempt
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        debug!("Requeueing {:?} after {:?}", key, delay);
        record_queue_retry();
        self.queue.add_after(key, delay);
    }

    /// Reset the attempt counter of `key`
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}
