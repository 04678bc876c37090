//! Point lookups into the Service cache

use crate::error::ControllerError;
use common::ResourceKey;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;

/// Read access to the current Service snapshots
///
/// `Ok(None)` means the Service does not exist; that is a normal signal, not
/// an error.
pub trait ServiceLister: Send + Sync {
    fn get_service(&self, key: &ResourceKey) -> Result<Option<Arc<Service>>, ControllerError>;
}

impl ServiceLister for Store<Service> {
    fn get_service(&self, key: &ResourceKey) -> Result<Option<Arc<Service>>, ControllerError> {
        let mut obj_ref = ObjectRef::new(key.name());
        if !key.namespace().is_empty() {
            obj_ref = obj_ref.within(key.namespace());
        }
        Ok(self.get(&obj_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::{reflector, watcher};

    #[test]
    fn test_store_lookup_by_key() {
        let (reader, mut writer) = reflector::store::<Service>();
        writer.apply_watcher_event(&watcher::Event::Apply(Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }));

        let found = reader
            .get_service(&ResourceKey::new("default", "web"))
            .expect("Store lookups never fail");
        assert_eq!(
            found.and_then(|svc| svc.metadata.name.clone()).as_deref(),
            Some("web")
        );

        let missing = reader
            .get_service(&ResourceKey::new("prod", "web"))
            .expect("Store lookups never fail");
        assert!(missing.is_none(), "Same name in another namespace is a different key");
    }
}
