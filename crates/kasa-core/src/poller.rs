// ── Periodic telemetry polling ──
//
// Two structurally identical loops: emeter over the polling set and
// sysinfo over the emeter set. Each cycle snapshots its device set,
// fans out one retried fetch per device, waits for all of them, then
// sleeps for whatever is left of the interval. No two cycles of the
// same loop overlap; the two loops run independently.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use strum::Display;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CollectorConfig;
use crate::device::{DeviceKind, DeviceRef, EmeterReading, display_name};
use crate::error::{DeviceError, ErrorKind};
use crate::hostname::HostnameCache;
use crate::normalize::SysinfoTransform;
use crate::registry::{DeviceRecord, DeviceRegistry};
use crate::retry::RetryPolicy;
use crate::sink::{EmeterRecord, EquipmentType, StorageSink, SysinfoRecord};

/// Fraction of the interval past which a cycle is reported as tight.
const TIGHT_INTERVAL_RATIO: f64 = 0.8;

/// Which of the two loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PollKind {
    Emeter,
    Sysinfo,
}

impl PollKind {
    fn operation(self) -> &'static str {
        match self {
            Self::Emeter => "emeter data fetch",
            Self::Sysinfo => "sysinfo fetch",
        }
    }
}

/// Result of one device's fetch-and-store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Points handed to the sink.
    Stored { points: usize },
    /// Response was unusable; nothing stored, not retried.
    Dropped { reason: String },
    /// Device has nothing to report for this loop.
    Skipped,
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub kind: PollKind,
    pub devices: usize,
    pub stored: usize,
    pub dropped: usize,
    pub skipped: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl CycleReport {
    fn new(kind: PollKind, devices: usize) -> Self {
        Self {
            kind,
            devices,
            stored: 0,
            dropped: 0,
            skipped: 0,
            failed: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Runs poll cycles against the registry and forwards results to the sink.
pub struct Poller {
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn StorageSink>,
    hostnames: Arc<HostnameCache>,
    transform: Arc<dyn SysinfoTransform>,
    retry: RetryPolicy,
    emeter_interval: Duration,
    sysinfo_interval: Duration,
    fetch_timeout: Duration,
}

impl Poller {
    /// Cadence, retry bounds and the per-attempt fetch timeout come from
    /// `config`.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn StorageSink>,
        hostnames: Arc<HostnameCache>,
        transform: Arc<dyn SysinfoTransform>,
        config: &CollectorConfig,
    ) -> Self {
        Self {
            registry,
            sink,
            hostnames,
            transform,
            retry: RetryPolicy::new(&config.fetch_retry),
            emeter_interval: config.emeter_interval,
            sysinfo_interval: config.sysinfo_interval,
            fetch_timeout: config.fetch_timeout,
        }
    }

    pub fn interval(&self, kind: PollKind) -> Duration {
        match kind {
            PollKind::Emeter => self.emeter_interval,
            PollKind::Sysinfo => self.sysinfo_interval,
        }
    }

    // ── Loops ────────────────────────────────────────────────────────

    /// Periodic emeter fetch until `cancel` fires.
    pub async fn run_emeter_loop(&self, cancel: CancellationToken) {
        self.run_loop(PollKind::Emeter, cancel).await;
    }

    /// Periodic sysinfo fetch until `cancel` fires.
    pub async fn run_sysinfo_loop(&self, cancel: CancellationToken) {
        self.run_loop(PollKind::Sysinfo, cancel).await;
    }

    async fn run_loop(&self, kind: PollKind, cancel: CancellationToken) {
        let interval = self.interval(kind);
        info!(poll = %kind, ?interval, "poll loop started");

        loop {
            let started = Instant::now();
            let report = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                report = self.run_cycle(kind) => report,
            };
            log_cycle(&report, interval);

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep_until(started + interval) => {}
            }
        }

        info!(poll = %kind, "poll loop stopped");
    }

    // ── Cycles ───────────────────────────────────────────────────────

    pub async fn emeter_cycle(&self) -> CycleReport {
        self.run_cycle(PollKind::Emeter).await
    }

    pub async fn sysinfo_cycle(&self) -> CycleReport {
        self.run_cycle(PollKind::Sysinfo).await
    }

    /// One full cycle over a snapshot of the relevant device set.
    pub async fn run_cycle(&self, kind: PollKind) -> CycleReport {
        let started = Instant::now();
        let snapshot = match kind {
            PollKind::Emeter => self.registry.polling_snapshot(),
            PollKind::Sysinfo => self.registry.emeter_snapshot(),
        };
        let mut report = CycleReport::new(kind, snapshot.len());
        if snapshot.is_empty() {
            debug!(poll = %kind, "no devices to poll");
            return report;
        }

        let results = join_all(snapshot.iter().map(|record| self.poll_device(kind, record))).await;

        for result in results {
            match result {
                Ok(FetchOutcome::Stored { .. }) => report.stored += 1,
                Ok(FetchOutcome::Dropped { .. }) => report.dropped += 1,
                Ok(FetchOutcome::Skipped) => report.skipped += 1,
                Err(_) => report.failed += 1,
            }
        }
        report.elapsed = started.elapsed();
        report
    }

    async fn poll_device(
        &self,
        kind: PollKind,
        record: &DeviceRecord,
    ) -> Result<FetchOutcome, DeviceError> {
        let outcome = self
            .retry
            .run(kind.operation(), &record.ip, || async move {
                let attempt = async {
                    match kind {
                        PollKind::Emeter => self.fetch_emeter(record).await,
                        PollKind::Sysinfo => self.fetch_sysinfo(record).await,
                    }
                };
                tokio::time::timeout(self.fetch_timeout, attempt)
                    .await
                    .unwrap_or_else(|_| {
                        Err(DeviceError::timeout(
                            &record.ip,
                            kind.operation(),
                            self.fetch_timeout,
                        ))
                    })
            })
            .await;

        if let Ok(FetchOutcome::Dropped { reason }) = &outcome {
            warn!(
                poll = %kind,
                ip = %record.ip,
                alias = %record.display_name(),
                reason = %reason,
                "dropping device contribution for this cycle"
            );
        }
        outcome
    }

    // ── Per-device fetches ───────────────────────────────────────────

    async fn fetch_emeter(&self, record: &DeviceRecord) -> Result<FetchOutcome, DeviceError> {
        record.handle.update().await?;

        match record.kind {
            DeviceKind::MultiOutletStrip => self.store_strip(record).await,
            DeviceKind::SimpleDevice if record.has_emeter => {
                let dns_name = self.hostnames.get_hostname(&record.ip).await;
                let emeter = match read_emeter(&record.handle) {
                    Ok(emeter) => emeter,
                    Err(e) if e.kind() == ErrorKind::Data => {
                        return Ok(FetchOutcome::Dropped {
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                };
                self.store_emeter(EmeterRecord {
                    ip: record.ip.clone(),
                    device_alias: record.display_name(),
                    dns_name,
                    equipment_type: EquipmentType::Device,
                    plug_alias: None,
                    plug_index: None,
                    emeter,
                })
                .await;
                Ok(FetchOutcome::Stored { points: 1 })
            }
            DeviceKind::SimpleDevice => Ok(FetchOutcome::Skipped),
        }
    }

    /// Aggregate point for the strip, then one point per metered outlet.
    ///
    /// All readings are taken before anything is stored, so a retried
    /// attempt never writes a partial strip twice. Malformed readings are
    /// skipped; any other failure fails the attempt.
    async fn store_strip(&self, record: &DeviceRecord) -> Result<FetchOutcome, DeviceError> {
        let dns_name = self.hostnames.get_hostname(&record.ip).await;
        let strip_alias = record.display_name();
        let mut records = Vec::new();
        let mut last_drop = None;

        if record.has_emeter {
            match read_emeter(&record.handle) {
                Ok(emeter) => records.push(EmeterRecord {
                    ip: record.ip.clone(),
                    device_alias: strip_alias.clone(),
                    dns_name: dns_name.clone(),
                    equipment_type: EquipmentType::Device,
                    plug_alias: None,
                    plug_index: None,
                    emeter,
                }),
                Err(e) if e.kind() == ErrorKind::Data => last_drop = Some(e.to_string()),
                Err(e) => return Err(e),
            }
        }

        for (position, child) in record.handle.children().iter().enumerate() {
            if !child.has_emeter() {
                continue;
            }
            let plug_index = position + 1;
            match read_emeter(child) {
                Ok(emeter) => records.push(EmeterRecord {
                    ip: record.ip.clone(),
                    device_alias: strip_alias.clone(),
                    dns_name: dns_name.clone(),
                    equipment_type: EquipmentType::Plug,
                    plug_alias: Some(
                        child
                            .alias()
                            .filter(|alias| !alias.is_empty())
                            .unwrap_or_else(|| format!("Plug {plug_index}")),
                    ),
                    plug_index: Some(plug_index),
                    emeter,
                }),
                Err(e) if e.kind() == ErrorKind::Data => {
                    debug!(ip = %record.ip, plug_index, error = %e, "skipping outlet reading");
                    last_drop = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        let points = records.len();
        for emeter_record in records {
            self.store_emeter(emeter_record).await;
        }

        Ok(match (points, last_drop) {
            (0, Some(reason)) => FetchOutcome::Dropped { reason },
            (0, None) => FetchOutcome::Skipped,
            (points, _) => FetchOutcome::Stored { points },
        })
    }

    async fn fetch_sysinfo(&self, record: &DeviceRecord) -> Result<FetchOutcome, DeviceError> {
        record.handle.update().await?;

        let sysinfo = match record.handle.sys_info() {
            Ok(sysinfo) => sysinfo,
            Err(e) if e.kind() == ErrorKind::Data => {
                return Ok(FetchOutcome::Dropped {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        let dns_name = self.hostnames.get_hostname(&record.ip).await;
        let sysinfo_record = SysinfoRecord {
            ip: record.ip.clone(),
            device_alias: display_name(record.handle.as_ref()),
            dns_name,
            equipment_type: EquipmentType::Device,
            sysinfo: self.transform.apply(sysinfo),
        };
        self.sink
            .process_sysinfo_data(BTreeMap::from([(record.ip.clone(), sysinfo_record)]))
            .await;
        Ok(FetchOutcome::Stored { points: 1 })
    }

    async fn store_emeter(&self, record: EmeterRecord) {
        self.sink
            .process_emeter_data(BTreeMap::from([(record.ip.clone(), record)]))
            .await;
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("emeter_interval", &self.emeter_interval)
            .field("sysinfo_interval", &self.sysinfo_interval)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("transform", &self.transform.name())
            .finish_non_exhaustive()
    }
}

fn log_cycle(report: &CycleReport, interval: Duration) {
    let elapsed_ms = report.elapsed.as_millis();
    if report.elapsed > interval {
        warn!(
            poll = %report.kind,
            devices = report.devices,
            elapsed_ms,
            ?interval,
            "cycle took longer than the interval, consider increasing it"
        );
    } else if report.elapsed > interval.mul_f64(TIGHT_INTERVAL_RATIO) {
        warn!(
            poll = %report.kind,
            devices = report.devices,
            elapsed_ms,
            ?interval,
            "cycle used over 80% of the interval"
        );
    }
    info!(
        poll = %report.kind,
        devices = report.devices,
        stored = report.stored,
        dropped = report.dropped,
        failed = report.failed,
        elapsed_ms,
        "poll cycle complete"
    );
}

/// Read and integer-truncate an emeter sample.
fn read_emeter(handle: &DeviceRef) -> Result<BTreeMap<String, i64>, DeviceError> {
    let reading = handle.emeter_realtime()?;
    to_integers(handle.host(), &reading)
}

#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn to_integers(host: &str, reading: &EmeterReading) -> Result<BTreeMap<String, i64>, DeviceError> {
    if reading.is_empty() {
        return Err(DeviceError::invalid_data(host, "empty emeter reading"));
    }
    reading
        .iter()
        .map(|(field, value)| {
            if value.is_finite() {
                Ok((field.clone(), value.trunc() as i64))
            } else {
                Err(DeviceError::invalid_data(
                    host,
                    format!("non-finite value for {field}"),
                ))
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use std::collections::HashSet;

    use super::*;
    use crate::config::RetryConfig;
    use crate::device::{DeviceHandle, SysInfo};
    use crate::normalize::RuleSet;
    use crate::registry::DeviceOrigin;
    use crate::sim::{RecordingSink, SimulatedDevice, StaticResolver};

    struct Fixture {
        registry: Arc<DeviceRegistry>,
        sink: Arc<RecordingSink>,
        poller: Arc<Poller>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(DeviceRegistry::new());
        let sink = Arc::new(RecordingSink::new());
        let hostnames = Arc::new(HostnameCache::new(
            Duration::from_secs(300),
            Arc::new(StaticResolver::new().with("10.0.0.1", "plug-1.lan")),
        ));
        let config = CollectorConfig {
            fetch_retry: RetryConfig {
                max_retries: 3,
                ..RetryConfig::default()
            },
            ..CollectorConfig::default()
        };
        let poller = Arc::new(Poller::new(
            registry.clone(),
            sink.clone(),
            hostnames,
            Arc::new(RuleSet::v1()),
            &config,
        ));
        Fixture {
            registry,
            sink,
            poller,
        }
    }

    async fn add(registry: &DeviceRegistry, device: Arc<SimulatedDevice>) {
        let ip = device.host().to_owned();
        registry
            .insert(DeviceRecord::new(ip, device, DeviceOrigin::Discovered))
            .await;
    }

    fn unreachable(host: &str) -> DeviceError {
        DeviceError::Connection {
            host: host.into(),
            reason: "host unreachable".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_device_does_not_affect_the_others() {
        let f = fixture();
        for n in 1..=4 {
            let ip = format!("10.0.0.{n}");
            let device = SimulatedDevice::plug(&ip, "Plug").with_emeter_power(10.0);
            add(&f.registry, device.into_ref()).await;
        }
        let broken = SimulatedDevice::plug("10.0.0.5", "Broken")
            .with_emeter_power(10.0)
            .always_failing(unreachable("10.0.0.5"))
            .into_ref();
        add(&f.registry, broken.clone()).await;

        let report = f.poller.emeter_cycle().await;

        assert_eq!(report.devices, 5);
        assert_eq!(report.stored, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(f.sink.emeter_calls(), 4);
        assert_eq!(broken.update_calls(), 3);
    }

    #[tokio::test]
    async fn emeter_values_are_truncated_and_tagged() {
        let f = fixture();
        let reading = EmeterReading::from([
            ("power_mw".to_owned(), 1234.9),
            ("voltage_mv".to_owned(), 229_876.4),
        ]);
        add(
            &f.registry,
            SimulatedDevice::plug("10.0.0.1", "Fridge").with_emeter(reading).into_ref(),
        )
        .await;

        f.poller.emeter_cycle().await;

        let batches = f.sink.emeter_batches();
        let record = &batches[0]["10.0.0.1"];
        assert_eq!(record.device_alias, "Fridge");
        assert_eq!(record.dns_name, "plug-1.lan");
        assert_eq!(record.equipment_type, EquipmentType::Device);
        assert_eq!(record.emeter["power_mw"], 1234);
        assert_eq!(record.emeter["voltage_mv"], 229_876);
    }

    #[tokio::test]
    async fn strip_emits_aggregate_and_per_outlet_points() {
        let f = fixture();
        let strip = SimulatedDevice::strip(
            "10.0.0.2",
            "Desk Strip",
            vec![
                SimulatedDevice::plug("10.0.0.2", "Monitor").with_emeter_power(30.0),
                SimulatedDevice::plug("10.0.0.2", "").with_emeter_power(5.0),
            ],
        )
        .into_ref();
        add(&f.registry, strip).await;

        let report = f.poller.emeter_cycle().await;

        assert_eq!(report.stored, 1);
        let records: Vec<EmeterRecord> = f
            .sink
            .emeter_batches()
            .into_iter()
            .flat_map(BTreeMap::into_values)
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].equipment_type, EquipmentType::Device);
        assert_eq!(records[1].plug_index, Some(1));
        assert_eq!(records[1].plug_alias.as_deref(), Some("Monitor"));
        assert_eq!(records[1].device_alias, "Desk Strip");
        assert_eq!(records[2].plug_alias.as_deref(), Some("Plug 2"));
        assert_eq!(records[2].equipment_type, EquipmentType::Plug);
    }

    #[tokio::test]
    async fn malformed_reading_is_dropped_without_retry() {
        let f = fixture();
        let device = SimulatedDevice::plug("10.0.0.3", "Odd")
            .with_emeter_power(1.0)
            .with_invalid_emeter()
            .into_ref();
        add(&f.registry, device.clone()).await;

        let report = f.poller.emeter_cycle().await;

        assert_eq!(report.dropped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(device.update_calls(), 1);
        assert_eq!(f.sink.emeter_calls(), 0);
    }

    #[tokio::test]
    async fn sysinfo_is_normalized_before_forwarding() {
        let f = fixture();
        let mut sysinfo = SysInfo::new();
        sysinfo.insert("fw_ver".into(), serde_json::json!("1.0.3"));
        add(
            &f.registry,
            SimulatedDevice::plug("10.0.0.1", "Heater")
                .with_emeter_power(800.0)
                .with_sys_info(sysinfo)
                .into_ref(),
        )
        .await;

        let report = f.poller.sysinfo_cycle().await;

        assert_eq!(report.stored, 1);
        let batches = f.sink.sysinfo_batches();
        let record = &batches[0]["10.0.0.1"];
        assert_eq!(record.sysinfo["sw_ver"], serde_json::json!("1.0.3"));
        assert!(!record.sysinfo.contains_key("fw_ver"));
        assert_eq!(record.device_alias, "Heater");
    }

    #[tokio::test]
    async fn non_emeter_devices_are_not_polled() {
        let f = fixture();
        let lamp = SimulatedDevice::plug("10.0.0.4", "Lamp").into_ref();
        add(&f.registry, lamp.clone()).await;

        let emeter = f.poller.emeter_cycle().await;
        let sysinfo = f.poller.sysinfo_cycle().await;

        assert_eq!(emeter.devices, 0);
        assert_eq!(sysinfo.devices, 0);
        assert_eq!(lamp.update_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_keeps_constant_cadence_and_stops_on_cancel() {
        let f = fixture();
        let device = SimulatedDevice::plug("10.0.0.1", "Slow")
            .with_emeter_power(1.0)
            .with_update_delay(Duration::from_secs(4))
            .into_ref();
        add(&f.registry, device.clone()).await;

        let cancel = CancellationToken::new();
        let poller = f.poller.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { poller.run_emeter_loop(cancel).await }
        });

        // Cycles start at t=0, 15, 30; the third is in flight at t=32.
        tokio::time::sleep(Duration::from_secs(32)).await;
        assert_eq!(device.update_calls(), 3);
        assert_eq!(f.sink.emeter_calls(), 2);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(f.sink.emeter_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wedged_device_times_out_instead_of_stalling_the_cycle() {
        let f = fixture();
        let healthy = SimulatedDevice::plug("10.0.0.1", "Healthy")
            .with_emeter_power(10.0)
            .into_ref();
        let wedged = SimulatedDevice::plug("10.0.0.2", "Wedged")
            .with_emeter_power(10.0)
            .with_update_delay(Duration::from_secs(365 * 24 * 3600))
            .into_ref();
        add(&f.registry, healthy).await;
        add(&f.registry, wedged.clone()).await;

        let report = f.poller.emeter_cycle().await;

        assert_eq!(report.stored, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(wedged.update_calls(), 3);
        // Three 10s attempts plus 2s and 4s of backoff.
        assert!(report.elapsed < Duration::from_secs(40), "{:?}", report.elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn wedged_device_does_not_stop_the_loop() {
        let f = fixture();
        add(
            &f.registry,
            SimulatedDevice::plug("10.0.0.1", "Healthy")
                .with_emeter_power(10.0)
                .into_ref(),
        )
        .await;
        add(
            &f.registry,
            SimulatedDevice::plug("10.0.0.2", "Wedged")
                .with_emeter_power(10.0)
                .with_update_delay(Duration::from_secs(365 * 24 * 3600))
                .into_ref(),
        )
        .await;

        let cancel = CancellationToken::new();
        let poller = f.poller.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { poller.run_emeter_loop(cancel).await }
        });

        // Each cycle takes ~36s, so cycles start at t=0, 36, 72.
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(f.sink.emeter_calls(), 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_uses_the_snapshot_taken_at_its_start() {
        let f = fixture();
        for ip in ["10.0.0.1", "10.0.0.2"] {
            add(
                &f.registry,
                SimulatedDevice::plug(ip, "Slow")
                    .with_emeter_power(10.0)
                    .with_update_delay(Duration::from_secs(4))
                    .into_ref(),
            )
            .await;
        }

        let poller = f.poller.clone();
        let cycle = tokio::spawn(async move { poller.emeter_cycle().await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let present = HashSet::from(["10.0.0.1".to_owned()]);
        f.registry.remove_missing(&present).await;
        let late = SimulatedDevice::plug("10.0.0.3", "Late")
            .with_emeter_power(10.0)
            .into_ref();
        add(&f.registry, late.clone()).await;

        let report = cycle.await.unwrap();

        assert_eq!(report.devices, 2);
        assert_eq!(report.stored, 2);
        assert_eq!(late.update_calls(), 0);
        assert_eq!(
            f.sink.emeter_ips(),
            HashSet::from(["10.0.0.1".to_owned(), "10.0.0.2".to_owned()])
        );
        assert_eq!(f.registry.polling_ips(), vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn outlet_network_error_is_retried_without_partial_writes() {
        let f = fixture();
        let reset = DeviceError::ConnectionReset {
            host: "10.0.0.2".into(),
        };
        let strip = SimulatedDevice::strip(
            "10.0.0.2",
            "Desk Strip",
            vec![
                SimulatedDevice::plug("10.0.0.2", "Monitor").with_emeter_power(30.0),
                SimulatedDevice::plug("10.0.0.2", "Lamp")
                    .with_emeter_power(5.0)
                    .with_emeter_error(reset),
            ],
        )
        .into_ref();
        add(&f.registry, strip.clone()).await;

        let report = f.poller.emeter_cycle().await;

        assert_eq!(report.failed, 1);
        assert_eq!(strip.update_calls(), 3);
        assert_eq!(f.sink.emeter_calls(), 0);
    }

    #[tokio::test]
    async fn malformed_outlet_reading_is_skipped() {
        let f = fixture();
        let strip = SimulatedDevice::strip(
            "10.0.0.2",
            "Desk Strip",
            vec![
                SimulatedDevice::plug("10.0.0.2", "Monitor").with_emeter_power(30.0),
                SimulatedDevice::plug("10.0.0.2", "Lamp")
                    .with_emeter_power(5.0)
                    .with_invalid_emeter(),
            ],
        )
        .into_ref();
        add(&f.registry, strip.clone()).await;

        let report = f.poller.emeter_cycle().await;

        assert_eq!(report.stored, 1);
        assert_eq!(strip.update_calls(), 1);
        assert_eq!(f.sink.emeter_calls(), 2);
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let reading = EmeterReading::from([("power_mw".to_owned(), f64::NAN)]);
        let err = to_integers("10.0.0.1", &reading).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);
        assert!(to_integers("10.0.0.1", &EmeterReading::new()).is_err());
    }
}
