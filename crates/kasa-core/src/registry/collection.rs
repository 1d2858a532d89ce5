// ── Reactive device collection ──
//
// Concurrent IP-keyed storage with a `watch` snapshot rebuilt on every
// mutation. Readers clone the snapshot `Arc` and never wait on writers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use super::DeviceRecord;

/// One of the registry's three IP-keyed maps.
///
/// Mutation is not serialized here; the owning [`DeviceRegistry`]
/// holds its writer lock around every call that changes membership.
///
/// [`DeviceRegistry`]: super::DeviceRegistry
pub(crate) struct DeviceCollection {
    by_ip: DashMap<String, Arc<DeviceRecord>>,

    /// Records sorted by IP, rebuilt on mutation.
    snapshot: watch::Sender<Arc<Vec<Arc<DeviceRecord>>>>,
}

impl DeviceCollection {
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            by_ip: DashMap::new(),
            snapshot,
        }
    }

    /// Insert or replace a record. Returns `true` if the IP was new.
    pub(crate) fn upsert(&self, record: Arc<DeviceRecord>) -> bool {
        let is_new = self.by_ip.insert(record.ip.clone(), record).is_none();
        self.rebuild_snapshot();
        is_new
    }

    /// Remove a record by IP. Returns the removed record if it existed.
    pub(crate) fn remove(&self, ip: &str) -> Option<Arc<DeviceRecord>> {
        let removed = self.by_ip.remove(ip).map(|(_, record)| record);
        if removed.is_some() {
            self.rebuild_snapshot();
        }
        removed
    }

    pub(crate) fn get(&self, ip: &str) -> Option<Arc<DeviceRecord>> {
        self.by_ip.get(ip).map(|r| Arc::clone(r.value()))
    }

    pub(crate) fn contains(&self, ip: &str) -> bool {
        self.by_ip.contains_key(ip)
    }

    /// Current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<DeviceRecord>>> {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<DeviceRecord>>>> {
        self.snapshot.subscribe()
    }

    pub(crate) fn clear(&self) {
        self.by_ip.clear();
        self.rebuild_snapshot();
    }

    pub(crate) fn len(&self) -> usize {
        self.by_ip.len()
    }

    /// All IPs, sorted.
    pub(crate) fn ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self.by_ip.iter().map(|r| r.key().clone()).collect();
        ips.sort();
        ips
    }

    fn rebuild_snapshot(&self) {
        let mut records: Vec<Arc<DeviceRecord>> =
            self.by_ip.iter().map(|r| Arc::clone(r.value())).collect();
        records.sort_by(|a, b| a.ip.cmp(&b.ip));
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(records));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::registry::DeviceOrigin;
    use crate::sim::SimulatedDevice;

    fn record(ip: &str) -> Arc<DeviceRecord> {
        let handle = SimulatedDevice::plug(ip, "Plug").with_emeter_power(1.0).into_ref();
        Arc::new(DeviceRecord::new(ip, handle, DeviceOrigin::Discovered))
    }

    #[test]
    fn upsert_reports_new_keys() {
        let col = DeviceCollection::new();
        assert!(col.upsert(record("10.0.0.1")));
        assert!(!col.upsert(record("10.0.0.1")));
        assert_eq!(col.len(), 1);
    }

    #[test]
    fn remove_returns_record_and_updates_snapshot() {
        let col = DeviceCollection::new();
        col.upsert(record("10.0.0.1"));
        col.upsert(record("10.0.0.2"));

        let removed = col.remove("10.0.0.1").unwrap();
        assert_eq!(removed.ip, "10.0.0.1");
        assert!(!col.contains("10.0.0.1"));
        assert!(col.remove("10.0.0.1").is_none());
        assert_eq!(col.snapshot().len(), 1);
    }

    #[test]
    fn snapshot_is_sorted_by_ip() {
        let col = DeviceCollection::new();
        col.upsert(record("10.0.0.9"));
        col.upsert(record("10.0.0.10"));
        col.upsert(record("10.0.0.1"));

        let ips: Vec<_> = col.snapshot().iter().map(|r| r.ip.clone()).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.10", "10.0.0.9"]);
        assert_eq!(col.ips(), ips);
    }

    #[test]
    fn held_snapshot_is_unaffected_by_later_mutation() {
        let col = DeviceCollection::new();
        col.upsert(record("10.0.0.1"));
        let before = col.snapshot();

        col.upsert(record("10.0.0.2"));
        col.clear();

        assert_eq!(before.len(), 1);
        assert!(col.snapshot().is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let col = DeviceCollection::new();
        let mut rx = col.subscribe();

        col.upsert(record("10.0.0.1"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);
    }
}
