//! Service controller
//!
//! Runs N workers over the shared rate-limited queue. A worker takes a key,
//! reconciles it, and reports the outcome back to the queue:
//! - success: the key's retry counter is reset
//! - retryable failure: the key is re-added with backoff, up to `max_retries`
//! - terminal failure or retries exhausted: the key is dropped until the next
//!   watch event brings it back
//!
//! The queue never hands the same key to two workers at once.

use crate::apis::metrics::record_queue_drop;
use crate::apis::service::lister::ServiceLister;
use crate::apis::service::reconciler::ServiceReconciler;
use crate::apis::service::status::StatusWriter;
use crate::error::ControllerError;
use crate::queue::RateLimitingQueue;
use common::ResourceKey;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct ServiceController<L, W> {
    queue: RateLimitingQueue<ResourceKey>,
    reconciler: Arc<ServiceReconciler<L, W>>,
    max_retries: u32,
}

impl<L, W> ServiceController<L, W>
where
    L: ServiceLister + 'static,
    W: StatusWriter + 'static,
{
    pub fn new(
        queue: RateLimitingQueue<ResourceKey>,
        reconciler: Arc<ServiceReconciler<L, W>>,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            reconciler,
            max_retries,
        }
    }

    pub fn queue(&self) -> &RateLimitingQueue<ResourceKey> {
        &self.queue
    }

    /// Run `workers` reconcile workers until `shutdown` is cancelled
    ///
    /// Workers start only after `cache_ready` resolves. Keys queued before
    /// that are kept and processed once the cache is synced. On shutdown the
    /// queue is closed and in-flight reconciliations run to completion.
    pub async fn run<F>(
        self: Arc<Self>,
        workers: usize,
        cache_ready: F,
        shutdown: CancellationToken,
    ) -> Result<(), ControllerError>
    where
        F: Future<Output = Result<(), ControllerError>> + Send,
    {
        info!("Starting service controller");

        tokio::select! {
            ready = cache_ready => {
                if let Err(e) = ready {
                    error!("Service cache failed to sync: {}", e);
                    self.queue.shut_down();
                    return Err(e);
                }
            }
            _ = shutdown.cancelled() => {
                info!("Shutdown before service cache synced");
                self.queue.shut_down();
                return Ok(());
            }
        }

        info!("Service cache synced, starting {} workers", workers);
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let controller = self.clone();
                tokio::spawn(async move { controller.worker(id).await })
            })
            .collect();

        shutdown.cancelled().await;
        info!("Shutting down service controller");
        self.queue.shut_down();

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Service worker panicked: {}", e);
            }
        }

        info!("Service controller stopped");
        Ok(())
    }

    async fn worker(&self, id: usize) {
        debug!("Service worker {} started", id);
        while self.process_next_work_item().await {}
        debug!("Service worker {} stopped", id);
    }

    /// Take one key from the queue and reconcile it
    ///
    /// Returns false once the queue is shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = self.reconciler.reconcile(&key).await;
        self.handle_err(&key, result.map(|_| ()));
        self.queue.done(&key);
        true
    }

    fn handle_err(&self, key: &ResourceKey, result: Result<(), ControllerError>) {
        let Err(e) = result else {
            self.queue.forget(key);
            return;
        };

        if !e.is_retryable() {
            warn!("Dropping service {} out of the queue: {}", key, e);
            self.queue.forget(key);
            record_queue_drop();
            return;
        }

        let requeues = self.queue.num_requeues(key);
        if requeues < self.max_retries {
            warn!(
                "Error syncing service {} (retry {}/{}): {}",
                key,
                requeues + 1,
                self.max_retries,
                e
            );
            self.queue.add_rate_limited(key.clone());
            return;
        }

        error!(
            "Dropping service {} out of the queue after {} retries: {}",
            key, requeues, e
        );
        self.queue.forget(key);
        record_queue_drop();
    }
}
