//! Service watcher
//!
//! Feeds the Service cache (a reflector store) from a watch stream and hands
//! every change to the [`ServiceEventHandler`].
//!
//! ## How It Works
//!
//! 1. Watch all Services across namespaces
//! 2. For each event, look up the previously cached object, then apply the
//!    event to the store, then notify the handler (add/update/delete)
//! 3. During a relist (`Init` .. `InitDone`) notifications are held back until
//!    the store has swapped in the fresh list, so workers never reconcile
//!    against the pre-relist snapshot
//! 4. Services cached before a relist but missing from it were deleted while
//!    the watch was down; they are reported as deletes

use crate::apis::service::event_ingest::{service_key, ServiceEventHandler};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{api::Api, Client};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Relisted object together with its pre-relist version
type PendingApply = (Option<Arc<Service>>, Service);

/// Applies watch events to the Service cache and notifies the handler
pub struct ServiceWatch {
    writer: Writer<Service>,
    reader: Store<Service>,
    handler: ServiceEventHandler,
    /// Objects seen since the last `Init`, flushed on `InitDone`
    relist: Option<Vec<PendingApply>>,
}

impl ServiceWatch {
    pub fn new(writer: Writer<Service>, handler: ServiceEventHandler) -> Self {
        let reader = writer.as_reader();
        Self {
            writer,
            reader,
            handler,
            relist: None,
        }
    }

    /// Apply one watch event
    pub fn handle_event(&mut self, event: watcher::Event<Service>) {
        match &event {
            watcher::Event::Apply(service) => {
                let previous = self.reader.get(&ObjectRef::from_obj(service));
                self.writer.apply_watcher_event(&event);
                self.notify_apply(previous, service);
            }
            watcher::Event::InitApply(service) => {
                let previous = self.reader.get(&ObjectRef::from_obj(service));
                self.writer.apply_watcher_event(&event);
                self.relist
                    .get_or_insert_with(Vec::new)
                    .push((previous, service.clone()));
            }
            watcher::Event::Delete(service) => {
                self.writer.apply_watcher_event(&event);
                self.handler.on_delete(service);
            }
            watcher::Event::Init => {
                debug!("Service watcher (re)listing");
                self.relist = Some(Vec::new());
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitDone => {
                let relisted = self.relist.take().unwrap_or_default();
                let seen: HashSet<_> = relisted
                    .iter()
                    .filter_map(|(_, service)| service_key(service).ok())
                    .collect();
                let vanished: Vec<Arc<Service>> = self
                    .reader
                    .state()
                    .into_iter()
                    .filter(|service| {
                        service_key(service)
                            .map(|key| !seen.contains(&key))
                            .unwrap_or(false)
                    })
                    .collect();

                self.writer.apply_watcher_event(&event);

                for (previous, service) in &relisted {
                    self.notify_apply(previous.clone(), service);
                }
                for service in &vanished {
                    self.handler.on_delete(service);
                }

                info!(
                    "Service watcher sync complete ({} services, {} removed while disconnected)",
                    relisted.len(),
                    vanished.len()
                );
            }
        }
    }

    fn notify_apply(&self, previous: Option<Arc<Service>>, service: &Service) {
        match previous {
            Some(old) => self.handler.on_update(&old, service),
            None => self.handler.on_add(service),
        }
    }

    /// Drive the cache from a watch stream until it ends
    pub async fn run<S>(mut self, stream: S)
    where
        S: Stream<Item = Result<watcher::Event<Service>, watcher::Error>>,
    {
        futures::pin_mut!(stream);

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.handle_event(event),
                Err(e) => warn!("Service watcher error: {}", e),
            }
        }
    }
}

/// Watch Services in all namespaces and feed them through `watch`
///
/// Runs until the watch stream ends; call it in a `tokio::spawn()` task.
pub async fn watch_services(client: Client, watch: ServiceWatch) {
    let api: Api<Service> = Api::all(client);
    let stream = watcher::watcher(api, WatcherConfig::default()).default_backoff();

    info!("Starting Service watcher");
    watch.run(stream).await;
}
