//! Service event ingest
//!
//! Translates watch notifications into queue insertions. No business logic
//! lives here: every decision about a Service is made by the reconciler.

use crate::queue::RateLimitingQueue;
use common::{KeyError, ResourceKey};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, warn};

/// Canonical `namespace/name` key of a Service
pub fn service_key(service: &Service) -> Result<ResourceKey, KeyError> {
    let name = service.metadata.name.clone().unwrap_or_default();
    if name.is_empty() {
        return Err(KeyError::EmptyName(format!(
            "{}/",
            service.namespace().unwrap_or_default()
        )));
    }
    Ok(ResourceKey::new(service.namespace().unwrap_or_default(), name))
}

/// Queues Service keys in response to watch events
#[derive(Clone)]
pub struct ServiceEventHandler {
    queue: RateLimitingQueue<ResourceKey>,
}

impl ServiceEventHandler {
    pub fn new(queue: RateLimitingQueue<ResourceKey>) -> Self {
        Self { queue }
    }

    pub fn on_add(&self, service: &Service) {
        if let Some(key) = self.key_or_warn(service) {
            debug!("Adding service {}", key);
            self.queue.add(key);
        }
    }

    /// Queue an updated Service
    ///
    /// Resyncs (same resource version) and objects marked for deletion are
    /// skipped; the delete event will follow.
    pub fn on_update(&self, old: &Service, new: &Service) {
        if old.resource_version() == new.resource_version()
            || new.metadata.deletion_timestamp.is_some()
        {
            return;
        }

        if let Some(key) = self.key_or_warn(new) {
            debug!("Updating service {}", key);
            self.queue.add(key);
        }
    }

    pub fn on_delete(&self, service: &Service) {
        if let Some(key) = self.key_or_warn(service) {
            debug!("Deleting service {}", key);
            self.queue.add(key);
        }
    }

    fn key_or_warn(&self, service: &Service) -> Option<ResourceKey> {
        match service_key(service) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Couldn't get key for service {:?}: {}", service.metadata, e);
                None
            }
        }
    }
}
