//! Service reconciler
//!
//! Decides, for one Service key at a time, whether the Service gets a tunnel
//! hostname, keeps the one it already has, or loses it.
//!
//! Per key the state is either Untracked (no tracker entry) or Tracked:
//!
//! | Service                         | Untracked           | Tracked                      |
//! |---------------------------------|---------------------|------------------------------|
//! | missing / not `LoadBalancer`    | nothing             | clear status, drop entry     |
//! | `LoadBalancer`, hostname in status | adopt it         | adopt it (no status write)   |
//! | `LoadBalancer`, no hostname     | assign, write status | assign, write status        |
//!
//! Only the first declared port is mapped; multi-port Services are not
//! supported.

use crate::apis::metrics::record_service_reconciliation;
use crate::apis::service::lister::ServiceLister;
use crate::apis::service::status::{assigned_hostname, hostname_status, StatusWriter};
use crate::error::ControllerError;
use crate::tracker::IngressTracker;
use common::{join_host_port, service_hostname, IngressRecord, ResourceKey};
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Service};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Service type that requests external reachability
pub const LOAD_BALANCER_TYPE: &str = "LoadBalancer";

/// Outcome of one reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Not eligible and not tracked
    Ignored,
    /// Tracker entry removed
    Released,
    /// Hostname found in status and tracked as-is
    Adopted,
    /// Hostname computed and written to status
    Assigned,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Ignored => "ignored",
            Transition::Released => "released",
            Transition::Adopted => "adopted",
            Transition::Assigned => "assigned",
        }
    }
}

/// Reconciles Services against the ingress tracker
pub struct ServiceReconciler<L, W> {
    lister: L,
    status: W,
    tracker: Arc<IngressTracker>,
}

impl<L, W> ServiceReconciler<L, W>
where
    L: ServiceLister,
    W: StatusWriter,
{
    pub fn new(lister: L, status: W, tracker: Arc<IngressTracker>, domain: Option<String>) -> Self {
        if let Some(domain) = &domain {
            info!(
                "Tunnel domain {} configured; generated hostnames are not suffixed with it",
                domain
            );
        }
        Self {
            lister,
            status,
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<IngressTracker> {
        &self.tracker
    }

    /// Public hostname for a Service key
    pub fn hostname_for(&self, key: &ResourceKey) -> String {
        service_hostname(key.name(), key.namespace())
    }

    /// Reconcile a single Service
    pub async fn reconcile(&self, key: &ResourceKey) -> Result<Transition, ControllerError> {
        let start = Instant::now();
        info!("Processing sync for service {}", key);

        let result = self.sync_service(key).await;

        let (transition, outcome) = match &result {
            Ok(transition) => (transition.as_str(), "success"),
            Err(_) => ("error", "error"),
        };
        record_service_reconciliation(
            key.namespace(),
            transition,
            start.elapsed().as_secs_f64(),
            outcome,
        );
        debug!(
            "Finished syncing service {} ({}): {:?}",
            key,
            transition,
            start.elapsed()
        );

        result
    }

    async fn sync_service(&self, key: &ResourceKey) -> Result<Transition, ControllerError> {
        let service = self.lister.get_service(key)?;

        let eligible = service.as_deref().filter(|svc| is_load_balancer(svc));
        let Some(svc) = eligible else {
            return self.release(key, service.is_some()).await;
        };

        // Already assigned, e.g. before a controller restart
        if let Some(hostname) = assigned_hostname(svc) {
            let record = IngressRecord::new(hostname, internal_address(key, svc)?);
            if self.tracker.upsert(key.clone(), record) {
                info!("Adopted hostname {} for service {}", hostname, key);
            }
            return Ok(Transition::Adopted);
        }

        let hostname = self.hostname_for(key);
        let internal_address = internal_address(key, svc)?;

        self.status
            .update_status(key.namespace(), key.name(), hostname_status(&hostname))
            .await?;

        info!(
            "Assigned hostname {} for service {} ({})",
            hostname, key, internal_address
        );
        self.tracker
            .upsert(key.clone(), IngressRecord::new(hostname, internal_address));
        Ok(Transition::Assigned)
    }

    /// Stop exposing `key`, clearing its status if the Service still exists
    async fn release(&self, key: &ResourceKey, exists: bool) -> Result<Transition, ControllerError> {
        let Some(record) = self.tracker.get(key) else {
            return Ok(Transition::Ignored);
        };

        if exists {
            self.status
                .update_status(key.namespace(), key.name(), LoadBalancerStatus::default())
                .await?;
        }

        info!("Released hostname {} for service {}", record.hostname, key);
        self.tracker.delete(key);
        Ok(Transition::Released)
    }
}

pub fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some(LOAD_BALANCER_TYPE)
}

/// `clusterIP:port` of the first declared port
fn internal_address(key: &ResourceKey, service: &Service) -> Result<String, ControllerError> {
    let invalid = |reason: &str| ControllerError::InvalidService {
        key: key.clone(),
        reason: reason.to_string(),
    };

    let spec = service.spec.as_ref().ok_or_else(|| invalid("missing spec"))?;
    let cluster_ip = spec
        .cluster_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .ok_or_else(|| invalid("no cluster IP allocated"))?;
    let port = spec
        .ports
        .as_ref()
        .and_then(|ports| ports.first())
        .ok_or_else(|| invalid("no ports declared"))?
        .port;
    let port = u16::try_from(port).map_err(|_| invalid("port out of range"))?;

    Ok(join_host_port(cluster_ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, ServicePort, ServiceSpec, ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::reflector::{self, Store};
    use kube::runtime::watcher;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStatusWriter {
        writes: Mutex<Vec<(String, LoadBalancerStatus)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingStatusWriter {
        fn writes(&self) -> Vec<(String, LoadBalancerStatus)> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatusWriter for RecordingStatusWriter {
        async fn update_status(
            &self,
            namespace: &str,
            name: &str,
            status: LoadBalancerStatus,
        ) -> Result<(), ControllerError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ControllerError::Cache("status write refused".to_string()));
            }
            self.writes
                .lock()
                .unwrap()
                .push((format!("{}/{}", namespace, name), status));
            Ok(())
        }
    }

    fn load_balancer(name: &str, namespace: &str, cluster_ip: &str, ports: &[i32]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(LOAD_BALANCER_TYPE.to_string()),
                cluster_ip: Some(cluster_ip.to_string()),
                ports: Some(
                    ports
                        .iter()
                        .map(|port| ServicePort {
                            port: *port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn with_hostname(mut service: Service, hostname: &str) -> Service {
        service.status = Some(ServiceStatus {
            load_balancer: Some(hostname_status(hostname)),
            ..Default::default()
        });
        service
    }

    type TestReconciler = ServiceReconciler<Store<Service>, Arc<RecordingStatusWriter>>;

    fn setup() -> (TestReconciler, Writer<Service>, Arc<RecordingStatusWriter>) {
        let (reader, writer) = reflector::store();
        let status = Arc::new(RecordingStatusWriter::default());
        let reconciler = ServiceReconciler::new(
            reader,
            status.clone(),
            Arc::new(IngressTracker::new()),
            None,
        );
        (reconciler, writer, status)
    }

    fn key() -> ResourceKey {
        ResourceKey::new("default", "web")
    }

    #[tokio::test]
    async fn test_assigns_hostname_to_new_load_balancer() {
        let (reconciler, mut writer, status) = setup();
        writer.apply_watcher_event(&watcher::Event::Apply(load_balancer(
            "web",
            "default",
            "10.0.0.5",
            &[80],
        )));

        let transition = reconciler.reconcile(&key()).await.expect("Should reconcile");

        assert_eq!(transition, Transition::Assigned);
        assert_eq!(
            reconciler.tracker().get(&key()),
            Some(IngressRecord::new("web-default", "10.0.0.5:80"))
        );
        assert_eq!(
            status.writes(),
            vec![("default/web".to_string(), hostname_status("web-default"))]
        );
    }

    #[tokio::test]
    async fn test_only_first_port_is_mapped() {
        let (reconciler, mut writer, _status) = setup();
        writer.apply_watcher_event(&watcher::Event::Apply(load_balancer(
            "web",
            "default",
            "10.0.0.5",
            &[443, 80],
        )));

        reconciler.reconcile(&key()).await.expect("Should reconcile");
        assert_eq!(
            reconciler.tracker().get(&key()).map(|r| r.internal_address),
            Some("10.0.0.5:443".to_string())
        );
    }

    #[tokio::test]
    async fn test_adopts_existing_hostname_without_writing() {
        let (reconciler, mut writer, status) = setup();
        writer.apply_watcher_event(&watcher::Event::Apply(with_hostname(
            load_balancer("web", "default", "10.0.0.5", &[80]),
            "web-default",
        )));

        let transition = reconciler.reconcile(&key()).await.expect("Should reconcile");

        assert_eq!(transition, Transition::Adopted);
        assert_eq!(
            reconciler.tracker().get(&key()),
            Some(IngressRecord::new("web-default", "10.0.0.5:80"))
        );
        assert!(status.writes().is_empty(), "Adoption must not write status");
    }

    #[tokio::test]
    async fn test_adoption_keeps_foreign_hostname() {
        let (reconciler, mut writer, _status) = setup();
        writer.apply_watcher_event(&watcher::Event::Apply(with_hostname(
            load_balancer("web", "default", "10.0.0.5", &[80]),
            "legacy.example.com",
        )));

        reconciler.reconcile(&key()).await.expect("Should reconcile");
        assert_eq!(
            reconciler.tracker().get(&key()).map(|r| r.hostname),
            Some("legacy.example.com".to_string()),
            "Adopted hostnames are never recomputed"
        );
    }

    #[tokio::test]
    async fn test_type_change_releases_and_clears_status() {
        let (reconciler, mut writer, status) = setup();
        let service = load_balancer("web", "default", "10.0.0.5", &[80]);
        writer.apply_watcher_event(&watcher::Event::Apply(service.clone()));
        reconciler.reconcile(&key()).await.expect("Should assign");

        let mut cluster_ip = with_hostname(service, "web-default");
        if let Some(spec) = cluster_ip.spec.as_mut() {
            spec.type_ = Some("ClusterIP".to_string());
        }
        writer.apply_watcher_event(&watcher::Event::Apply(cluster_ip));

        let transition = reconciler.reconcile(&key()).await.expect("Should release");

        assert_eq!(transition, Transition::Released);
        assert!(reconciler.tracker().get(&key()).is_none());
        assert_eq!(
            status.writes().last(),
            Some(&("default/web".to_string(), LoadBalancerStatus::default()))
        );
    }

    #[tokio::test]
    async fn test_failed_clear_keeps_entry_for_retry() {
        let (reconciler, mut writer, status) = setup();
        let service = load_balancer("web", "default", "10.0.0.5", &[80]);
        writer.apply_watcher_event(&watcher::Event::Apply(service.clone()));
        reconciler.reconcile(&key()).await.expect("Should assign");

        let mut node_port = service;
        if let Some(spec) = node_port.spec.as_mut() {
            spec.type_ = Some("NodePort".to_string());
        }
        writer.apply_watcher_event(&watcher::Event::Apply(node_port));
        status.fail.store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(reconciler.reconcile(&key()).await.is_err());
        assert!(
            reconciler.tracker().get(&key()).is_some(),
            "Entry stays until the status clear succeeds"
        );
    }

    #[tokio::test]
    async fn test_deleted_service_is_released_without_write() {
        let (reconciler, mut writer, status) = setup();
        let service = load_balancer("web", "default", "10.0.0.5", &[80]);
        writer.apply_watcher_event(&watcher::Event::Apply(service.clone()));
        reconciler.reconcile(&key()).await.expect("Should assign");

        writer.apply_watcher_event(&watcher::Event::Delete(service));
        let transition = reconciler.reconcile(&key()).await.expect("Should release");

        assert_eq!(transition, Transition::Released);
        assert!(reconciler.tracker().is_empty());
        assert_eq!(status.writes().len(), 1, "Only the original assignment was written");
    }

    #[tokio::test]
    async fn test_untracked_ineligible_is_noop() {
        let (reconciler, mut writer, status) = setup();
        let mut service = load_balancer("web", "default", "10.0.0.5", &[80]);
        if let Some(spec) = service.spec.as_mut() {
            spec.type_ = Some("ClusterIP".to_string());
        }
        writer.apply_watcher_event(&watcher::Event::Apply(service));

        assert_eq!(
            reconciler.reconcile(&key()).await.expect("Should reconcile"),
            Transition::Ignored
        );
        assert_eq!(
            reconciler
                .reconcile(&ResourceKey::new("default", "missing"))
                .await
                .expect("Missing service is not an error"),
            Transition::Ignored
        );
        assert!(status.writes().is_empty());
    }

    #[tokio::test]
    async fn test_status_write_failure_leaves_untracked() {
        let (reconciler, mut writer, status) = setup();
        writer.apply_watcher_event(&watcher::Event::Apply(load_balancer(
            "web",
            "default",
            "10.0.0.5",
            &[80],
        )));
        status.fail.store(true, std::sync::atomic::Ordering::SeqCst);

        let err = reconciler
            .reconcile(&key())
            .await
            .expect_err("Write failure should surface");
        assert!(err.is_retryable());
        assert!(reconciler.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_service_without_ports_is_rejected() {
        let (reconciler, mut writer, status) = setup();
        writer.apply_watcher_event(&watcher::Event::Apply(load_balancer(
            "web", "default", "10.0.0.5", &[],
        )));

        let err = reconciler
            .reconcile(&key())
            .await
            .expect_err("Service without ports cannot be mapped");
        assert!(matches!(err, ControllerError::InvalidService { .. }));
        assert!(status.writes().is_empty(), "Nothing is published for unroutable services");
    }

    #[test]
    fn test_ipv6_cluster_address() {
        let service = load_balancer("web", "default", "fd00::10", &[8080]);
        assert_eq!(
            internal_address(&key(), &service).expect("Should build address"),
            "[fd00::10]:8080"
        );
    }

    #[test]
    fn test_domain_is_not_appended() {
        let (reader, _writer) = reflector::store::<Service>();
        let reconciler = ServiceReconciler::new(
            reader,
            Arc::new(RecordingStatusWriter::default()),
            Arc::new(IngressTracker::new()),
            Some("example.com".to_string()),
        );

        assert_eq!(reconciler.hostname_for(&key()), "web-default");
    }

    #[test]
    fn test_foreign_ingress_entries_are_ignored() {
        let mut service = load_balancer("web", "default", "10.0.0.5", &[80]);
        service.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("192.0.2.1".to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        assert!(is_load_balancer(&service));
        assert_eq!(assigned_hostname(&service), None);
    }
}
