//! Ingress Tracker
//!
//! Mapping of Service keys to their assigned public hostname and internal
//! address. One coarse-grained mutex guards the whole map; it is held only
//! for the duration of a map operation, never across an `.await`.
//!
//! Writers are the reconcile workers. The config sync loop only reads, via
//! [`IngressTracker::snapshot`], and waits on [`IngressTracker::changed`].

use crate::apis::metrics::tracked_ingresses_gauge;
use common::{IngressRecord, ResourceKey};
use prometheus::IntGauge;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::warn;

/// Safe Mutex lock helper that recovers from poisoning
#[inline]
fn safe_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex poisoned, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Concurrent store of assigned ingress mappings
pub struct IngressTracker {
    entries: Mutex<HashMap<ResourceKey, IngressRecord>>,
    changed: Notify,
    /// Mirrors the map size; only set while `entries` is locked
    gauge: IntGauge,
}

impl IngressTracker {
    pub fn new() -> Self {
        Self::with_gauge(tracked_ingresses_gauge())
    }

    /// Tracker reporting its size on `gauge`
    pub fn with_gauge(gauge: IntGauge) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            gauge,
        }
    }

    /// Insert or replace the record for `key`
    ///
    /// Returns true if the stored record changed.
    pub fn upsert(&self, key: ResourceKey, record: IngressRecord) -> bool {
        let changed = {
            let mut entries = safe_lock(&self.entries);
            let changed = entries.get(&key) != Some(&record);
            if changed {
                entries.insert(key, record);
                self.gauge.set(entries.len() as i64);
            }
            changed
        };

        if changed {
            self.changed.notify_one();
        }
        changed
    }

    pub fn get(&self, key: &ResourceKey) -> Option<IngressRecord> {
        safe_lock(&self.entries).get(key).cloned()
    }

    /// Remove the record for `key`, returning it if one was tracked
    pub fn delete(&self, key: &ResourceKey) -> Option<IngressRecord> {
        let removed = {
            let mut entries = safe_lock(&self.entries);
            let removed = entries.remove(key);
            if removed.is_some() {
                self.gauge.set(entries.len() as i64);
            }
            removed
        };

        if removed.is_some() {
            self.changed.notify_one();
        }
        removed
    }

    /// Copy of all records, sorted by hostname
    ///
    /// Stable ordering keeps the rendered daemon configuration byte-identical
    /// while the set of mappings is unchanged.
    pub fn snapshot(&self) -> Vec<IngressRecord> {
        let mut records: Vec<IngressRecord> = safe_lock(&self.entries).values().cloned().collect();
        records.sort_by(|a, b| {
            a.hostname
                .cmp(&b.hostname)
                .then_with(|| a.internal_address.cmp(&b.internal_address))
        });
        records
    }

    pub fn len(&self) -> usize {
        safe_lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until the tracker is mutated
    ///
    /// A mutation that happens while nobody is waiting is remembered, so the
    /// next call returns immediately.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

impl Default for IngressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IngressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngressTracker")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn web() -> (ResourceKey, IngressRecord) {
        (
            ResourceKey::new("default", "web"),
            IngressRecord::new("web-default", "10.0.0.5:80"),
        )
    }

    #[test]
    fn test_upsert_get_delete() {
        let tracker = IngressTracker::new();
        let (key, record) = web();

        assert!(tracker.get(&key).is_none());
        assert!(tracker.upsert(key.clone(), record.clone()));
        assert_eq!(tracker.get(&key), Some(record.clone()));
        assert_eq!(tracker.len(), 1);

        assert_eq!(tracker.delete(&key), Some(record));
        assert!(tracker.is_empty());
        assert_eq!(tracker.delete(&key), None, "Second delete is a no-op");
    }

    #[test]
    fn test_upsert_same_record_is_not_a_change() {
        let tracker = IngressTracker::new();
        let (key, record) = web();

        assert!(tracker.upsert(key.clone(), record.clone()));
        assert!(
            !tracker.upsert(key.clone(), record),
            "Identical record should not count as a mutation"
        );
        assert!(tracker.upsert(key, IngressRecord::new("web-default", "10.0.0.6:80")));
    }

    #[test]
    fn test_snapshot_is_sorted_copy() {
        let tracker = IngressTracker::new();
        tracker.upsert(
            ResourceKey::new("prod", "api"),
            IngressRecord::new("api-prod", "10.0.0.9:443"),
        );
        tracker.upsert(
            ResourceKey::new("default", "web"),
            IngressRecord::new("web-default", "10.0.0.5:80"),
        );

        let snapshot = tracker.snapshot();
        let hostnames: Vec<&str> = snapshot.iter().map(|r| r.hostname.as_str()).collect();
        assert_eq!(hostnames, vec!["api-prod", "web-default"]);

        // Mutating the tracker afterwards must not affect the copy
        tracker.delete(&ResourceKey::new("prod", "api"));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(tracker.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_remembers_mutation_without_waiter() {
        let tracker = IngressTracker::new();
        let (key, record) = web();
        tracker.upsert(key, record);

        tokio::time::timeout(Duration::from_secs(1), tracker.changed())
            .await
            .expect("Pending mutation should wake the next waiter");
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let tracker = Arc::new(IngressTracker::new());
        let mut handles = vec![];

        for i in 0..16 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let key = ResourceKey::new("default", format!("svc-{}", i));
                tracker.upsert(
                    key,
                    IngressRecord::new(format!("svc-{}-default", i), format!("10.0.0.{}:80", i)),
                );
            }));
        }
        for handle in handles {
            handle.await.expect("Writer task should not panic");
        }

        assert_eq!(tracker.len(), 16);
        assert_eq!(tracker.snapshot().len(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_gauge_matches_size_after_concurrent_mutations() {
        let gauge = IntGauge::new("test_tracked_ingresses", "tracker size").expect("Valid gauge");
        let tracker = Arc::new(IngressTracker::with_gauge(gauge.clone()));
        let mut handles = vec![];

        for i in 0..32 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..50 {
                    let key = ResourceKey::new("default", format!("svc-{}", (i + round) % 8));
                    if round % 3 == 0 {
                        tracker.delete(&key);
                    } else {
                        tracker.upsert(
                            key,
                            IngressRecord::new(format!("svc-{}", i), format!("10.0.0.{}:80", round)),
                        );
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.expect("Writer task should not panic");
        }

        assert_eq!(gauge.get(), tracker.len() as i64);
    }
}
