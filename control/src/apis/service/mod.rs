//! Service LoadBalancer reconciliation
//!
//! - `watcher`: feeds the Service cache and the event handler
//! - `event_ingest`: turns watch events into queue keys
//! - `lister`: read access to the Service cache
//! - `reconciler`: per-key hostname assignment state machine
//! - `status`: `status.loadBalancer` write-back

pub mod event_ingest;
pub mod lister;
pub mod reconciler;
pub mod status;
pub mod watcher;

pub use event_ingest::{service_key, ServiceEventHandler};
pub use lister::ServiceLister;
pub use reconciler::{ServiceReconciler, Transition, LOAD_BALANCER_TYPE};
pub use status::{KubeStatusWriter, StatusWriter};
pub use watcher::{watch_services, ServiceWatch};
