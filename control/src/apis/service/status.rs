//! Service status write-back
//!
//! The only external write the reconciler performs: publishing (or clearing)
//! the tunnel hostname in `status.loadBalancer`.

use crate::error::ControllerError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Service};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Status subresource writer
///
/// Writes are assumed idempotent and last-write-wins. Any error is retried by
/// the caller.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: LoadBalancerStatus,
    ) -> Result<(), ControllerError>;
}

#[async_trait]
impl<T: StatusWriter + ?Sized> StatusWriter for Arc<T> {
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: LoadBalancerStatus,
    ) -> Result<(), ControllerError> {
        (**self).update_status(namespace, name, status).await
    }
}

/// Status writer backed by the Kubernetes API
pub struct KubeStatusWriter {
    client: Client,
    field_manager: String,
}

impl KubeStatusWriter {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: LoadBalancerStatus,
    ) -> Result<(), ControllerError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = load_balancer_status_patch(&status);

        api.patch_status(
            name,
            &PatchParams::apply(&self.field_manager),
            &Patch::Merge(&patch),
        )
        .await?;

        debug!("Updated Service {}/{} status: {}", namespace, name, patch);
        Ok(())
    }
}

/// Status advertising a single tunnel hostname
pub fn hostname_status(hostname: &str) -> LoadBalancerStatus {
    LoadBalancerStatus {
        ingress: Some(vec![LoadBalancerIngress {
            hostname: Some(hostname.to_string()),
            ..Default::default()
        }]),
    }
}

/// First non-empty hostname already published in the Service status
pub fn assigned_hostname(service: &Service) -> Option<&str> {
    service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| {
            ingress
                .iter()
                .filter_map(|i| i.hostname.as_deref())
                .find(|hostname| !hostname.is_empty())
        })
}

/// JSON merge patch replacing `status.loadBalancer.ingress`
///
/// An empty status becomes an explicit `null`; merge patches leave keys that
/// are merely absent untouched.
fn load_balancer_status_patch(status: &LoadBalancerStatus) -> Value {
    let ingress = status.ingress.as_ref().filter(|ingress| !ingress.is_empty());
    json!({
        "status": {
            "loadBalancer": {
                "ingress": ingress
            }
        }
    })
}
