// ── Device registry ──
//
// Three IP-keyed collections: every known device, the emeter-capable
// subset, and the subset the poller fetches. Every membership change
// goes through a single async writer lock so the subset invariants
// hold between operations. Readers take snapshots and never wait.

mod collection;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use strum::Display;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::auth::{AuthOutcome, Authenticator};
use crate::device::{DeviceKind, DeviceRef, display_name};
use crate::error::DeviceError;
use crate::hostname::HostnameCache;

use self::collection::DeviceCollection;

/// How a device entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceOrigin {
    Manual,
    Discovered,
}

/// A known device. Capabilities are resolved once, when the record is
/// built from a validated handle.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub ip: String,
    pub handle: DeviceRef,
    pub kind: DeviceKind,
    pub has_emeter: bool,
    pub origin: DeviceOrigin,
    pub first_seen: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn new(ip: impl Into<String>, handle: DeviceRef, origin: DeviceOrigin) -> Self {
        Self {
            ip: ip.into(),
            kind: handle.kind(),
            has_emeter: handle.has_emeter(),
            handle,
            origin,
            first_seen: Utc::now(),
        }
    }

    pub fn display_name(&self) -> String {
        display_name(self.handle.as_ref())
    }
}

/// Result of [`DeviceRegistry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { emeter: bool },
    AlreadyKnown,
}

/// Result of [`DeviceRegistry::merge_discovered`].
#[derive(Debug)]
pub enum MergeOutcome {
    AlreadyKnown,
    Added(Arc<DeviceRecord>),
    Rejected { reason: String },
    Failed(AuthOutcome),
}

/// Owner of the device maps.
pub struct DeviceRegistry {
    devices: DeviceCollection,
    emeter: DeviceCollection,
    polling: DeviceCollection,
    writer: Mutex<()>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: DeviceCollection::new(),
            emeter: DeviceCollection::new(),
            polling: DeviceCollection::new(),
            writer: Mutex::new(()),
        }
    }

    // ── Mutation ─────────────────────────────────────────────────────

    /// Insert a validated device unless its IP is already known.
    pub async fn insert(&self, record: DeviceRecord) -> InsertOutcome {
        let _guard = self.writer.lock().await;
        if self.devices.contains(&record.ip) {
            return InsertOutcome::AlreadyKnown;
        }
        let record = Arc::new(record);
        self.devices.upsert(Arc::clone(&record));
        let emeter = self.classify_locked(&record);
        InsertOutcome::Inserted { emeter }
    }

    /// Re-read the emeter flag from `handle` and place `ip` in or out of
    /// the emeter and polling subsets. Returns whether the device is now
    /// polled. Unknown IPs are left alone.
    pub async fn check_and_classify(&self, ip: &str, handle: &DeviceRef) -> bool {
        let _guard = self.writer.lock().await;
        let Some(current) = self.devices.get(ip) else {
            return false;
        };
        let mut updated = (*current).clone();
        updated.handle = Arc::clone(handle);
        updated.kind = handle.kind();
        updated.has_emeter = handle.has_emeter();
        let updated = Arc::new(updated);
        self.devices.upsert(Arc::clone(&updated));
        self.classify_locked(&updated)
    }

    /// Caller must hold the writer lock.
    fn classify_locked(&self, record: &Arc<DeviceRecord>) -> bool {
        if record.has_emeter {
            self.emeter.upsert(Arc::clone(record));
            self.polling.upsert(Arc::clone(record));
            true
        } else {
            self.emeter.remove(&record.ip);
            self.polling.remove(&record.ip);
            false
        }
    }

    /// Evict and disconnect every device whose IP is not in `present`.
    /// Returns the evicted records.
    pub async fn remove_missing(&self, present: &HashSet<String>) -> Vec<Arc<DeviceRecord>> {
        let removed = {
            let _guard = self.writer.lock().await;
            let mut removed = Vec::new();
            for ip in self.devices.ips() {
                if present.contains(&ip) {
                    continue;
                }
                self.emeter.remove(&ip);
                self.polling.remove(&ip);
                if let Some(record) = self.devices.remove(&ip) {
                    info!(ip = %record.ip, alias = %record.display_name(), "removing missing device");
                    removed.push(record);
                }
            }
            removed
        };
        disconnect_records(&removed).await;
        removed
    }

    /// Resolve, connect and insert one manually configured host.
    pub async fn add_manual(
        &self,
        host: &str,
        authenticator: &Authenticator,
        hostnames: &HostnameCache,
    ) -> Result<Arc<DeviceRecord>, DeviceError> {
        let ip = resolve_ipv4(host).await?;
        if let Some(existing) = self.devices.get(&ip) {
            debug!(host, ip = %ip, "manual device already known");
            return Ok(existing);
        }

        let handle = authenticator.connect_manual(&ip).await?;
        let record = DeviceRecord::new(ip.clone(), Arc::clone(&handle), DeviceOrigin::Manual);
        let hostname = hostnames.get_hostname(&ip).await;
        match self.insert(record).await {
            InsertOutcome::Inserted { emeter } => {
                info!(host, ip = %ip, hostname = %hostname, emeter, "added manual device");
            }
            InsertOutcome::AlreadyKnown => {
                debug!(host, ip = %ip, "manual device added concurrently");
                if let Err(e) = handle.disconnect().await {
                    debug!(ip = %ip, error = %e, "disconnect of duplicate handle failed");
                }
            }
        }
        self.devices
            .get(&ip)
            .ok_or_else(|| DeviceError::Other(format!("{ip} vanished during manual add")))
    }

    /// Add every manual host concurrently. A failing host is logged and
    /// skipped. Returns `(added, failed)`.
    pub async fn initialize_manual_devices(
        &self,
        hosts: &[String],
        authenticator: &Authenticator,
        hostnames: &HostnameCache,
    ) -> (usize, usize) {
        if hosts.is_empty() {
            return (0, 0);
        }
        info!(count = hosts.len(), "initializing manual devices");

        let results = join_all(
            hosts
                .iter()
                .map(|host| self.add_manual(host, authenticator, hostnames)),
        )
        .await;

        let mut added = 0;
        let mut failed = 0;
        for (host, result) in hosts.iter().zip(results) {
            match result {
                Ok(_) => added += 1,
                Err(e) => {
                    warn!(host, kind = %e.kind(), error = %e, "failed to add manual device");
                    failed += 1;
                }
            }
        }
        (added, failed)
    }

    /// Authenticate and insert a discovered candidate unless its IP is
    /// already known.
    pub async fn merge_discovered(
        &self,
        ip: &str,
        candidate: DeviceRef,
        authenticator: &Authenticator,
    ) -> MergeOutcome {
        if self.devices.contains(ip) {
            return MergeOutcome::AlreadyKnown;
        }

        match authenticator.authenticate(ip, candidate).await {
            AuthOutcome::Authenticated { handle, path } => {
                let record = DeviceRecord::new(ip, Arc::clone(&handle), DeviceOrigin::Discovered);
                match self.insert(record).await {
                    InsertOutcome::Inserted { .. } => {
                        debug!(ip, %path, "authenticated discovered device");
                        self.devices
                            .get(ip)
                            .map_or(MergeOutcome::AlreadyKnown, MergeOutcome::Added)
                    }
                    InsertOutcome::AlreadyKnown => {
                        // Lost a race with a manual add of the same IP.
                        if let Err(e) = handle.disconnect().await {
                            debug!(ip, error = %e, "disconnect of duplicate handle failed");
                        }
                        MergeOutcome::AlreadyKnown
                    }
                }
            }
            AuthOutcome::Rejected { reason } => MergeOutcome::Rejected { reason },
            failed @ AuthOutcome::Failed { .. } => MergeOutcome::Failed(failed),
        }
    }

    /// Empty all maps, then disconnect the removed devices concurrently.
    /// Returns the number of failed disconnects.
    ///
    /// Each device is handed to exactly one caller, so concurrent calls
    /// never disconnect the same handle twice.
    pub async fn disconnect_all(&self) -> usize {
        let records = {
            let _guard = self.writer.lock().await;
            let records = self.devices.snapshot();
            self.polling.clear();
            self.emeter.clear();
            self.devices.clear();
            records
        };
        disconnect_records(&records).await
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn get(&self, ip: &str) -> Option<Arc<DeviceRecord>> {
        self.devices.get(ip)
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.devices.contains(ip)
    }

    pub fn is_emeter(&self, ip: &str) -> bool {
        self.emeter.contains(ip)
    }

    pub fn is_polled(&self, ip: &str) -> bool {
        self.polling.contains(ip)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn emeter_count(&self) -> usize {
        self.emeter.len()
    }

    pub fn polling_count(&self) -> usize {
        self.polling.len()
    }

    pub fn device_ips(&self) -> Vec<String> {
        self.devices.ips()
    }

    pub fn emeter_ips(&self) -> Vec<String> {
        self.emeter.ips()
    }

    pub fn polling_ips(&self) -> Vec<String> {
        self.polling.ips()
    }

    pub fn devices_snapshot(&self) -> Arc<Vec<Arc<DeviceRecord>>> {
        self.devices.snapshot()
    }

    pub fn emeter_snapshot(&self) -> Arc<Vec<Arc<DeviceRecord>>> {
        self.emeter.snapshot()
    }

    pub fn polling_snapshot(&self) -> Arc<Vec<Arc<DeviceRecord>>> {
        self.polling.snapshot()
    }

    /// Subscribe to changes of the polling set.
    pub fn subscribe_polling(&self) -> watch::Receiver<Arc<Vec<Arc<DeviceRecord>>>> {
        self.polling.subscribe()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.len())
            .field("emeter", &self.emeter.len())
            .field("polling", &self.polling.len())
            .finish()
    }
}

/// Disconnect `records` concurrently. Returns the number of failures.
async fn disconnect_records(records: &[Arc<DeviceRecord>]) -> usize {
    let results = join_all(records.iter().map(|record| async move {
        record
            .handle
            .disconnect()
            .await
            .map_err(|e| (record.ip.clone(), e))
    }))
    .await;

    let mut failures = 0;
    for result in results {
        if let Err((ip, e)) = result {
            warn!(ip = %ip, error = %e, "error disconnecting device");
            failures += 1;
        }
    }
    failures
}

/// First IPv4 address for `host`. IP literals are returned unchanged.
async fn resolve_ipv4(host: &str) -> Result<String, DeviceError> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ip.to_string());
    }
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| DeviceError::Resolve {
            host: host.to_owned(),
            reason: e.to_string(),
        })?;
    addrs
        .map(|addr| addr.ip())
        .find(std::net::IpAddr::is_ipv4)
        .map(|ip| ip.to_string())
        .ok_or_else(|| DeviceError::Resolve {
            host: host.to_owned(),
            reason: "no IPv4 address".into(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::AuthConfig;
    use crate::sim::{Behavior, SimulatedDevice, SimulatedHost, SimulatedProtocol, StaticResolver};

    fn emeter_plug(ip: &str) -> DeviceRef {
        SimulatedDevice::plug(ip, "Metered").with_emeter_power(12.5).into_ref()
    }

    fn plain_plug(ip: &str) -> DeviceRef {
        SimulatedDevice::plug(ip, "Lamp").into_ref()
    }

    fn assert_subsets(registry: &DeviceRegistry) {
        for ip in registry.emeter_ips() {
            assert!(registry.contains(&ip), "{ip} in emeter but not devices");
            assert!(registry.get(&ip).unwrap().has_emeter);
        }
        for ip in registry.polling_ips() {
            assert!(registry.contains(&ip), "{ip} polled but not in devices");
        }
    }

    fn authenticator(protocol: Arc<SimulatedProtocol>) -> Authenticator {
        Authenticator::new(protocol, None, AuthConfig::default())
    }

    fn hostnames() -> HostnameCache {
        HostnameCache::new(Duration::from_secs(300), Arc::new(StaticResolver::new()))
    }

    #[tokio::test]
    async fn insert_classifies_by_emeter_flag() {
        let registry = DeviceRegistry::new();

        let first = registry
            .insert(DeviceRecord::new("10.0.0.5", emeter_plug("10.0.0.5"), DeviceOrigin::Manual))
            .await;
        let second = registry
            .insert(DeviceRecord::new("10.0.0.9", plain_plug("10.0.0.9"), DeviceOrigin::Discovered))
            .await;

        assert_eq!(first, InsertOutcome::Inserted { emeter: true });
        assert_eq!(second, InsertOutcome::Inserted { emeter: false });
        assert_eq!(registry.device_ips(), vec!["10.0.0.5", "10.0.0.9"]);
        assert_eq!(registry.emeter_ips(), vec!["10.0.0.5"]);
        assert_eq!(registry.polling_ips(), vec!["10.0.0.5"]);
        assert_subsets(&registry);
    }

    #[tokio::test]
    async fn insert_never_replaces_known_ip() {
        let registry = DeviceRegistry::new();
        registry
            .insert(DeviceRecord::new("10.0.0.5", emeter_plug("10.0.0.5"), DeviceOrigin::Manual))
            .await;

        let again = registry
            .insert(DeviceRecord::new("10.0.0.5", plain_plug("10.0.0.5"), DeviceOrigin::Discovered))
            .await;

        assert_eq!(again, InsertOutcome::AlreadyKnown);
        assert_eq!(registry.get("10.0.0.5").unwrap().origin, DeviceOrigin::Manual);
        assert!(registry.is_emeter("10.0.0.5"));
    }

    #[tokio::test]
    async fn check_and_classify_is_idempotent() {
        let registry = DeviceRegistry::new();
        let handle = plain_plug("10.0.0.7");
        registry
            .insert(DeviceRecord::new("10.0.0.7", handle.clone(), DeviceOrigin::Discovered))
            .await;

        let metered = emeter_plug("10.0.0.7");
        assert!(registry.check_and_classify("10.0.0.7", &metered).await);
        assert!(registry.check_and_classify("10.0.0.7", &metered).await);
        assert_eq!(registry.emeter_count(), 1);
        assert_eq!(registry.polling_count(), 1);

        assert!(!registry.check_and_classify("10.0.0.7", &handle).await);
        assert_eq!(registry.emeter_count(), 0);
        assert_eq!(registry.polling_count(), 0);
        assert_eq!(registry.device_count(), 1);

        assert!(!registry.check_and_classify("10.0.0.99", &metered).await);
        assert!(!registry.contains("10.0.0.99"));
        assert_subsets(&registry);
    }

    #[tokio::test]
    async fn remove_missing_evicts_exactly_absent_ips() {
        let registry = DeviceRegistry::new();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"] {
            registry
                .insert(DeviceRecord::new(ip, emeter_plug(ip), DeviceOrigin::Discovered))
                .await;
        }
        let present: HashSet<String> = ["10.0.0.2", "10.0.0.4", "10.0.0.8"]
            .into_iter()
            .map(String::from)
            .collect();

        let removed = registry.remove_missing(&present).await;

        let mut removed_ips: Vec<_> = removed.iter().map(|r| r.ip.clone()).collect();
        removed_ips.sort();
        assert_eq!(removed_ips, vec!["10.0.0.1", "10.0.0.3"]);
        assert_eq!(registry.device_ips(), vec!["10.0.0.2", "10.0.0.4"]);
        assert_eq!(registry.emeter_ips(), vec!["10.0.0.2", "10.0.0.4"]);
        assert_subsets(&registry);
    }

    #[tokio::test]
    async fn evicted_devices_are_disconnected() {
        let stays = emeter_plug("10.0.0.1");
        let leaves = SimulatedDevice::plug("10.0.0.2", "Gone").with_emeter_power(1.0).into_ref();
        let registry = DeviceRegistry::new();
        registry
            .insert(DeviceRecord::new("10.0.0.1", stays, DeviceOrigin::Discovered))
            .await;
        registry
            .insert(DeviceRecord::new("10.0.0.2", leaves.clone(), DeviceOrigin::Manual))
            .await;

        let present = HashSet::from(["10.0.0.1".to_owned()]);
        registry.remove_missing(&present).await;

        assert_eq!(leaves.disconnect_calls(), 1);
        assert_eq!(registry.device_ips(), vec!["10.0.0.1"]);
    }

    #[tokio::test]
    async fn polling_watch_follows_membership() {
        let registry = DeviceRegistry::new();
        let mut polling = registry.subscribe_polling();
        assert!(polling.borrow_and_update().is_empty());

        registry
            .insert(DeviceRecord::new("10.0.0.5", emeter_plug("10.0.0.5"), DeviceOrigin::Discovered))
            .await;
        assert!(polling.has_changed().unwrap());
        let ips: Vec<String> = polling
            .borrow_and_update()
            .iter()
            .map(|record| record.ip.clone())
            .collect();
        assert_eq!(ips, vec!["10.0.0.5"]);
        assert!(registry.is_polled("10.0.0.5"));

        registry
            .insert(DeviceRecord::new("10.0.0.9", plain_plug("10.0.0.9"), DeviceOrigin::Discovered))
            .await;
        assert!(!registry.is_polled("10.0.0.9"));

        registry.remove_missing(&HashSet::new()).await;
        assert!(polling.has_changed().unwrap());
        assert!(polling.borrow_and_update().is_empty());
        assert!(!registry.is_polled("10.0.0.5"));
    }

    #[tokio::test]
    async fn concurrent_disconnect_all_releases_each_handle_once() {
        let device = SimulatedDevice::plug("10.0.0.1", "A").with_emeter_power(1.0).into_ref();
        let registry = DeviceRegistry::new();
        registry
            .insert(DeviceRecord::new("10.0.0.1", device.clone(), DeviceOrigin::Manual))
            .await;

        let (first, second) = tokio::join!(registry.disconnect_all(), registry.disconnect_all());

        assert_eq!((first, second), (0, 0));
        assert_eq!(device.disconnect_calls(), 1);
        assert_eq!(registry.device_count(), 0);
    }

    #[tokio::test]
    async fn merge_discovered_skips_known_ip_without_authenticating() {
        let known = emeter_plug("10.0.0.5");
        let candidate = SimulatedDevice::plug("10.0.0.5", "Dup").into_ref();
        let protocol = Arc::new(SimulatedProtocol::new().with(SimulatedHost::new(candidate.clone())));
        let registry = DeviceRegistry::new();
        registry
            .insert(DeviceRecord::new("10.0.0.5", known, DeviceOrigin::Manual))
            .await;

        let outcome = registry
            .merge_discovered("10.0.0.5", candidate.clone(), &authenticator(protocol))
            .await;

        assert!(matches!(outcome, MergeOutcome::AlreadyKnown));
        assert_eq!(candidate.update_calls(), 0);
    }

    #[tokio::test]
    async fn failed_manual_host_does_not_block_others() {
        let good = SimulatedDevice::plug("10.0.0.5", "Good").with_emeter_power(5.0).into_ref();
        let bad = SimulatedDevice::plug("10.0.0.6", "Bad").into_ref();
        let unreachable = DeviceError::Connection {
            host: "10.0.0.6".into(),
            reason: "no route to host".into(),
        };
        let protocol = Arc::new(
            SimulatedProtocol::new()
                .with(SimulatedHost::new(good))
                .with(
                    SimulatedHost::new(bad)
                        .discover_single(Behavior::Fail(unreachable.clone()))
                        .connect(Behavior::Fail(unreachable)),
                ),
        );
        let registry = DeviceRegistry::new();

        let (added, failed) = registry
            .initialize_manual_devices(
                &["10.0.0.5".to_owned(), "10.0.0.6".to_owned()],
                &authenticator(protocol),
                &hostnames(),
            )
            .await;

        assert_eq!((added, failed), (1, 1));
        assert_eq!(registry.device_ips(), vec!["10.0.0.5"]);
        assert_eq!(registry.get("10.0.0.5").unwrap().origin, DeviceOrigin::Manual);
    }

    #[tokio::test]
    async fn disconnect_all_tolerates_failures_and_clears() {
        let ok = SimulatedDevice::plug("10.0.0.1", "A").with_emeter_power(1.0).into_ref();
        let broken = SimulatedDevice::plug("10.0.0.2", "B")
            .with_emeter_power(1.0)
            .failing_disconnect()
            .into_ref();
        let registry = DeviceRegistry::new();
        registry
            .insert(DeviceRecord::new("10.0.0.1", ok.clone(), DeviceOrigin::Manual))
            .await;
        registry
            .insert(DeviceRecord::new("10.0.0.2", broken.clone(), DeviceOrigin::Manual))
            .await;

        let failures = registry.disconnect_all().await;

        assert_eq!(failures, 1);
        assert_eq!(ok.disconnect_calls(), 1);
        assert_eq!(broken.disconnect_calls(), 1);
        assert_eq!(registry.device_count(), 0);
        assert!(registry.polling_snapshot().is_empty());
    }

    #[tokio::test]
    async fn resolve_ipv4_passes_literals_through() {
        assert_eq!(resolve_ipv4("10.0.0.5").await.unwrap(), "10.0.0.5");
        assert_eq!(resolve_ipv4("localhost").await.unwrap(), "127.0.0.1");
    }
}
