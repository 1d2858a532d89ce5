// ── Simulated device backend ──
//
// In-memory implementations of the collaborator traits. Every device
// and host is scriptable (update failures, connect behavior, latency)
// and counts the calls made against it. Used by the test suites and by
// `kasa-collector run --simulate`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::Credentials;
use crate::device::{
    DeviceFamily, DeviceHandle, DeviceKind, DeviceProtocol, DeviceRef, DiscoveryRequest,
    EmeterReading, SysInfo,
};
use crate::error::DeviceError;
use crate::hostname::HostnameResolver;
use crate::sink::{EmeterBatch, SinkError, StorageSink, SysinfoBatch};

const NOMINAL_VOLTAGE_MV: f64 = 230_000.0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Devices ──────────────────────────────────────────────────────────

/// Scriptable device handle.
#[derive(Debug)]
pub struct SimulatedDevice {
    host: String,
    alias: String,
    model: String,
    family: DeviceFamily,
    kind: DeviceKind,
    has_emeter: bool,
    reading: EmeterReading,
    sys_info: SysInfo,
    children: Vec<Arc<SimulatedDevice>>,
    emeter_error: Option<DeviceError>,
    update_error: Option<DeviceError>,
    /// Remaining scripted failures; `u32::MAX` fails forever.
    failures_left: AtomicU32,
    update_delay: Mutex<Duration>,
    fail_disconnect: bool,
    update_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
}

impl SimulatedDevice {
    /// Single outlet without metering.
    pub fn plug(host: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            alias: alias.into(),
            model: "HS103".to_owned(),
            family: DeviceFamily::Legacy,
            kind: DeviceKind::SimpleDevice,
            has_emeter: false,
            reading: EmeterReading::new(),
            sys_info: SysInfo::new(),
            children: Vec::new(),
            emeter_error: None,
            update_error: None,
            failures_left: AtomicU32::new(0),
            update_delay: Mutex::new(Duration::ZERO),
            fail_disconnect: false,
            update_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
        }
    }

    /// Metered power strip. The aggregate reading is the sum of the
    /// outlets' readings.
    pub fn strip(
        host: impl Into<String>,
        alias: impl Into<String>,
        outlets: Vec<SimulatedDevice>,
    ) -> Self {
        let mut reading = EmeterReading::new();
        for outlet in &outlets {
            for (field, value) in &outlet.reading {
                if field == "voltage_mv" {
                    reading.insert(field.clone(), *value);
                } else {
                    *reading.entry(field.clone()).or_insert(0.0) += value;
                }
            }
        }
        Self {
            model: "HS300".to_owned(),
            kind: DeviceKind::MultiOutletStrip,
            has_emeter: true,
            reading,
            children: outlets.into_iter().map(Arc::new).collect(),
            ..Self::plug(host, alias)
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_family(mut self, family: DeviceFamily) -> Self {
        self.family = family;
        self
    }

    /// Enable metering with an explicit reading.
    pub fn with_emeter(mut self, reading: EmeterReading) -> Self {
        self.has_emeter = true;
        self.reading = reading;
        self
    }

    /// Enable metering with a reading derived from `watts` at 230 V.
    pub fn with_emeter_power(self, watts: f64) -> Self {
        let power_mw = watts * 1000.0;
        let current_ma = power_mw / NOMINAL_VOLTAGE_MV * 1000.0;
        self.with_emeter(EmeterReading::from([
            ("power_mw".to_owned(), power_mw),
            ("voltage_mv".to_owned(), NOMINAL_VOLTAGE_MV),
            ("current_ma".to_owned(), current_ma),
            ("total_wh".to_owned(), watts * 24.0),
        ]))
    }

    /// Make `emeter_realtime` report malformed data.
    pub fn with_invalid_emeter(self) -> Self {
        let error = DeviceError::invalid_data(&self.host, "emeter response missing power");
        self.with_emeter_error(error)
    }

    /// Make `emeter_realtime` fail with `error`.
    pub fn with_emeter_error(mut self, error: DeviceError) -> Self {
        self.emeter_error = Some(error);
        self
    }

    pub fn with_sys_info(mut self, sys_info: SysInfo) -> Self {
        self.sys_info = sys_info;
        self
    }

    pub fn with_update_delay(self, delay: Duration) -> Self {
        self.set_update_delay(delay);
        self
    }

    /// Change the latency of later updates, e.g. to wedge a device that
    /// is already registered.
    pub fn set_update_delay(&self, delay: Duration) {
        *lock(&self.update_delay) = delay;
    }

    /// Fail the next `times` updates with `error`.
    pub fn failing_updates(mut self, times: u32, error: DeviceError) -> Self {
        self.update_error = Some(error);
        self.failures_left = AtomicU32::new(times);
        self
    }

    /// Fail every update with `error`.
    pub fn always_failing(self, error: DeviceError) -> Self {
        self.failing_updates(u32::MAX, error)
    }

    pub fn failing_disconnect(mut self) -> Self {
        self.fail_disconnect = true;
        self
    }

    pub fn into_ref(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    fn next_update_result(&self) -> Result<(), DeviceError> {
        let Some(error) = &self.update_error else {
            return Ok(());
        };
        let scripted = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if scripted { Err(error.clone()) } else { Ok(()) }
    }

    fn default_sys_info(&self) -> SysInfo {
        let mut doc = SysInfo::new();
        doc.insert("alias".into(), json!(self.alias));
        doc.insert("model".into(), json!(self.model));
        doc.insert("sw_ver".into(), json!("1.0.12 Build 210507 Rel.182410"));
        doc.insert("hw_ver".into(), json!("2.0"));
        doc.insert("rssi".into(), json!(-52));
        doc.insert("relay_state".into(), json!(1));
        if !self.children.is_empty() {
            let outlets: Vec<Value> = self
                .children
                .iter()
                .enumerate()
                .map(|(i, child)| json!({"id": format!("{i:02}"), "alias": child.alias, "state": 1}))
                .collect();
            doc.insert("child_num".into(), json!(outlets.len()));
            doc.insert("children".into(), Value::Array(outlets));
        }
        doc
    }
}

#[async_trait]
impl DeviceHandle for SimulatedDevice {
    fn host(&self) -> &str {
        &self.host
    }

    fn alias(&self) -> Option<String> {
        Some(self.alias.clone())
    }

    fn model(&self) -> Option<String> {
        Some(self.model.clone())
    }

    fn family(&self) -> DeviceFamily {
        self.family
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn has_emeter(&self) -> bool {
        self.has_emeter
    }

    async fn update(&self) -> Result<(), DeviceError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.update_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.next_update_result()
    }

    fn emeter_realtime(&self) -> Result<EmeterReading, DeviceError> {
        if !self.has_emeter {
            return Err(DeviceError::Unsupported {
                host: self.host.clone(),
                reason: "device has no emeter".into(),
            });
        }
        if let Some(error) = &self.emeter_error {
            return Err(error.clone());
        }
        Ok(self.reading.clone())
    }

    fn sys_info(&self) -> Result<SysInfo, DeviceError> {
        if self.sys_info.is_empty() {
            Ok(self.default_sys_info())
        } else {
            Ok(self.sys_info.clone())
        }
    }

    fn children(&self) -> Vec<DeviceRef> {
        self.children
            .iter()
            .map(|child| -> DeviceRef { child.clone() })
            .collect()
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect {
            return Err(DeviceError::ConnectionReset {
                host: self.host.clone(),
            });
        }
        Ok(())
    }
}

// ── Protocol ─────────────────────────────────────────────────────────

/// Scripted response of a connect-like operation.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(DeviceError),
    /// Fail the first `n` calls, then succeed.
    FailTimes(u32, DeviceError),
    /// Never complete.
    Hang,
}

impl Behavior {
    fn next(&mut self) -> Option<Result<(), DeviceError>> {
        match self {
            Self::Succeed => Some(Ok(())),
            Self::Fail(error) => Some(Err(error.clone())),
            Self::FailTimes(0, _) => {
                *self = Self::Succeed;
                Some(Ok(()))
            }
            Self::FailTimes(n, error) => {
                *n -= 1;
                Some(Err(error.clone()))
            }
            Self::Hang => None,
        }
    }
}

/// Number of protocol calls made for one host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub discover_single: usize,
    pub connect_with_credentials: usize,
    pub connect_without_credentials: usize,
}

/// One reachable address on the simulated network.
#[derive(Debug)]
pub struct SimulatedHost {
    device: Arc<SimulatedDevice>,
    candidate: Option<Arc<SimulatedDevice>>,
    discoverable: bool,
    discover_single: Behavior,
    with_credentials: Behavior,
    without_credentials: Behavior,
    calls: CallCounts,
}

impl SimulatedHost {
    pub fn new(device: Arc<SimulatedDevice>) -> Self {
        Self {
            device,
            candidate: None,
            discoverable: true,
            discover_single: Behavior::Succeed,
            with_credentials: Behavior::Succeed,
            without_credentials: Behavior::Succeed,
            calls: CallCounts::default(),
        }
    }

    /// Handle returned by broadcast discovery, when it differs from the
    /// one returned by a fresh connection.
    pub fn discovered_as(mut self, candidate: Arc<SimulatedDevice>) -> Self {
        self.candidate = Some(candidate);
        self
    }

    /// Does not answer broadcast discovery.
    pub fn hidden(mut self) -> Self {
        self.discoverable = false;
        self
    }

    pub fn discover_single(mut self, behavior: Behavior) -> Self {
        self.discover_single = behavior;
        self
    }

    pub fn connect_with_credentials(mut self, behavior: Behavior) -> Self {
        self.with_credentials = behavior;
        self
    }

    pub fn connect_without_credentials(mut self, behavior: Behavior) -> Self {
        self.without_credentials = behavior;
        self
    }

    /// Same behavior with and without credentials.
    pub fn connect(self, behavior: Behavior) -> Self {
        self.connect_with_credentials(behavior.clone())
            .connect_without_credentials(behavior)
    }

    fn ip(&self) -> &str {
        self.device.host()
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    DiscoverSingle,
    Connect { authenticated: bool },
}

/// In-memory device network.
#[derive(Debug, Default)]
pub struct SimulatedProtocol {
    hosts: Mutex<BTreeMap<String, SimulatedHost>>,
    discovery_error: Mutex<Option<DeviceError>>,
    discover_calls: AtomicUsize,
}

impl SimulatedProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, host: SimulatedHost) -> Self {
        self.add(host);
        self
    }

    pub fn add(&self, host: SimulatedHost) {
        lock(&self.hosts).insert(host.ip().to_owned(), host);
    }

    pub fn remove(&self, ip: &str) {
        lock(&self.hosts).remove(ip);
    }

    pub fn set_discoverable(&self, ip: &str, discoverable: bool) {
        if let Some(host) = lock(&self.hosts).get_mut(ip) {
            host.discoverable = discoverable;
        }
    }

    /// Make broadcast discovery fail until cleared with `None`.
    pub fn fail_discovery(&self, error: Option<DeviceError>) {
        *lock(&self.discovery_error) = error;
    }

    pub fn calls(&self, ip: &str) -> CallCounts {
        lock(&self.hosts)
            .get(ip)
            .map(|host| host.calls)
            .unwrap_or_default()
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    /// A small mixed fleet on 192.168.50.0/24 for dry runs.
    pub fn demo() -> Self {
        let strip = SimulatedDevice::strip(
            "192.168.50.10",
            "Office Strip",
            vec![
                SimulatedDevice::plug("192.168.50.10", "Monitor").with_emeter_power(27.5),
                SimulatedDevice::plug("192.168.50.10", "Laptop Dock").with_emeter_power(41.0),
                SimulatedDevice::plug("192.168.50.10", "Desk Lamp").with_emeter_power(8.2),
            ],
        );
        Self::new()
            .with(SimulatedHost::new(strip.into_ref()))
            .with(SimulatedHost::new(
                SimulatedDevice::plug("192.168.50.11", "Fridge")
                    .with_model("HS110")
                    .with_emeter_power(96.4)
                    .into_ref(),
            ))
            .with(SimulatedHost::new(
                SimulatedDevice::plug("192.168.50.12", "Washer")
                    .with_model("KP115")
                    .with_emeter_power(512.0)
                    .into_ref(),
            ))
            .with(SimulatedHost::new(
                SimulatedDevice::plug("192.168.50.13", "Porch Light").into_ref(),
            ))
    }

    /// Apply the scripted behavior for `op` on `ip`, outside the lock.
    async fn respond(&self, ip: &str, op: Op) -> Result<DeviceRef, DeviceError> {
        let step = {
            let mut hosts = lock(&self.hosts);
            let Some(host) = hosts.get_mut(ip) else {
                return Err(DeviceError::Connection {
                    host: ip.to_owned(),
                    reason: "no route to host".into(),
                });
            };
            let behavior = match op {
                Op::DiscoverSingle => {
                    host.calls.discover_single += 1;
                    &mut host.discover_single
                }
                Op::Connect {
                    authenticated: true,
                } => {
                    host.calls.connect_with_credentials += 1;
                    &mut host.with_credentials
                }
                Op::Connect {
                    authenticated: false,
                } => {
                    host.calls.connect_without_credentials += 1;
                    &mut host.without_credentials
                }
            };
            let device: DeviceRef = host.device.clone();
            behavior.next().map(|result| result.map(|()| device))
        };
        match step {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl DeviceProtocol for SimulatedProtocol {
    async fn discover(
        &self,
        _request: &DiscoveryRequest,
    ) -> Result<HashMap<String, DeviceRef>, DeviceError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.discovery_error).clone() {
            return Err(error);
        }
        Ok(lock(&self.hosts)
            .iter()
            .filter(|(_, host)| host.discoverable)
            .map(|(ip, host)| {
                let handle: DeviceRef = host.candidate.as_ref().unwrap_or(&host.device).clone();
                (ip.clone(), handle)
            })
            .collect())
    }

    async fn discover_single(
        &self,
        host: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<DeviceRef, DeviceError> {
        self.respond(host, Op::DiscoverSingle).await
    }

    async fn connect(
        &self,
        host: &str,
        credentials: Option<&Credentials>,
    ) -> Result<DeviceRef, DeviceError> {
        self.respond(
            host,
            Op::Connect {
                authenticated: credentials.is_some(),
            },
        )
        .await
    }
}

// ── Resolver ─────────────────────────────────────────────────────────

/// Fixed reverse-lookup table that counts lookups. Unknown IPs fail.
#[derive(Debug, Default)]
pub struct StaticResolver {
    names: HashMap<String, String>,
    calls: Mutex<HashMap<String, usize>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: &str, hostname: &str) -> Self {
        self.names.insert(ip.to_owned(), hostname.to_owned());
        self
    }

    pub fn calls(&self, ip: &str) -> usize {
        lock(&self.calls).get(ip).copied().unwrap_or(0)
    }
}

impl HostnameResolver for StaticResolver {
    fn resolve(&self, ip: &str) -> io::Result<String> {
        *lock(&self.calls).entry(ip.to_owned()).or_insert(0) += 1;
        self.names
            .get(ip)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no PTR record"))
    }
}

// ── Sink ─────────────────────────────────────────────────────────────

/// Sink that keeps every batch in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    emeter: Mutex<Vec<EmeterBatch>>,
    sysinfo: Mutex<Vec<SysinfoBatch>>,
    unreachable: Option<String>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose `verify` fails with `reason`.
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            unreachable: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn emeter_batches(&self) -> Vec<EmeterBatch> {
        lock(&self.emeter).clone()
    }

    pub fn sysinfo_batches(&self) -> Vec<SysinfoBatch> {
        lock(&self.sysinfo).clone()
    }

    pub fn emeter_calls(&self) -> usize {
        lock(&self.emeter).len()
    }

    pub fn sysinfo_calls(&self) -> usize {
        lock(&self.sysinfo).len()
    }

    /// IPs that produced at least one emeter record.
    pub fn emeter_ips(&self) -> HashSet<String> {
        lock(&self.emeter)
            .iter()
            .flat_map(|batch| batch.keys().cloned())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageSink for RecordingSink {
    async fn verify(&self) -> Result<(), SinkError> {
        match &self.unreachable {
            Some(reason) => Err(SinkError::Unreachable {
                endpoint: "memory://".into(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn process_emeter_data(&self, batch: EmeterBatch) {
        if !self.is_closed() {
            lock(&self.emeter).push(batch);
        }
    }

    async fn process_sysinfo_data(&self, batch: SysinfoBatch) {
        if !self.is_closed() {
            lock(&self.sysinfo).push(batch);
        }
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}
