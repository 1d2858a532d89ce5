// ── Network discovery ──
//
// One discovery pass: broadcast, authenticate every unknown candidate
// concurrently, optionally evict devices that stopped answering, and
// report what happened. The first pass logs per-device detail at INFO,
// later passes at DEBUG.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::{Level, debug, info, warn};

use crate::auth::{AuthOutcome, Authenticator};
use crate::config::DiscoveryConfig;
use crate::device::{DeviceProtocol, DiscoveryRequest};
use crate::error::DeviceError;
use crate::hostname::HostnameCache;
use crate::registry::{DeviceRegistry, MergeOutcome};

/// Aggregate result of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    /// Devices that answered the broadcast.
    pub discovered: usize,
    /// Answering devices not yet in the registry.
    pub candidates: usize,
    pub authenticated: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Devices evicted for not answering.
    pub removed: usize,
    pub elapsed: Duration,
}

/// Runs discovery passes against the registry.
pub struct Discoverer {
    protocol: Arc<dyn DeviceProtocol>,
    registry: Arc<DeviceRegistry>,
    authenticator: Arc<Authenticator>,
    hostnames: Arc<HostnameCache>,
    config: DiscoveryConfig,
    keep_missing_devices: bool,
    first_pass: AtomicBool,
}

// Per-device lines are louder on the first pass.
macro_rules! pass_event {
    ($first:expr, $($arg:tt)+) => {
        if $first {
            tracing::event!(Level::INFO, $($arg)+);
        } else {
            tracing::event!(Level::DEBUG, $($arg)+);
        }
    };
}

impl Discoverer {
    pub fn new(
        protocol: Arc<dyn DeviceProtocol>,
        registry: Arc<DeviceRegistry>,
        authenticator: Arc<Authenticator>,
        hostnames: Arc<HostnameCache>,
        config: DiscoveryConfig,
        keep_missing_devices: bool,
    ) -> Self {
        Self {
            protocol,
            registry,
            authenticator,
            hostnames,
            config,
            keep_missing_devices,
            first_pass: AtomicBool::new(true),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Run one discovery pass.
    ///
    /// Per-candidate failures are counted, never returned. An error means
    /// the broadcast itself failed; the registry is left untouched.
    pub async fn discover_devices(&self) -> Result<DiscoverySummary, DeviceError> {
        if !self.config.enabled {
            debug!("auto discovery disabled");
            return Ok(DiscoverySummary::default());
        }
        let first = self.first_pass.swap(false, Ordering::SeqCst);
        let started = Instant::now();
        pass_event!(first, timeout = ?self.config.timeout, "starting device discovery");

        let request = DiscoveryRequest {
            timeout: self.config.timeout,
            packets: self.config.packets,
            credentials: self.authenticator.credentials().cloned(),
        };
        let found = self.protocol.discover(&request).await?;

        let mut summary = DiscoverySummary {
            discovered: found.len(),
            ..DiscoverySummary::default()
        };
        let present: HashSet<String> = found.keys().cloned().collect();

        let candidates: Vec<_> = found
            .into_iter()
            .filter(|(ip, _)| !self.registry.contains(ip))
            .collect();
        summary.candidates = candidates.len();

        let outcomes = join_all(candidates.into_iter().map(|(ip, candidate)| async move {
            let outcome = self
                .registry
                .merge_discovered(&ip, candidate, &self.authenticator)
                .await;
            (ip, outcome)
        }))
        .await;

        for (ip, outcome) in outcomes {
            match outcome {
                MergeOutcome::Added(record) => {
                    summary.authenticated += 1;
                    let hostname = self.hostnames.get_hostname(&ip).await;
                    pass_event!(
                        first,
                        ip = %ip,
                        hostname = %hostname,
                        alias = %record.display_name(),
                        emeter = record.has_emeter,
                        "discovered device"
                    );
                }
                MergeOutcome::AlreadyKnown => {}
                MergeOutcome::Rejected { reason } => {
                    summary.rejected += 1;
                    pass_event!(first, ip = %ip, reason = %reason, "device rejected");
                }
                MergeOutcome::Failed(AuthOutcome::Failed { error, hint }) => {
                    summary.failed += 1;
                    warn!(ip = %ip, %hint, error = %error, "failed to authenticate device");
                }
                MergeOutcome::Failed(_) => summary.failed += 1,
            }
        }

        if !self.keep_missing_devices {
            summary.removed = self.registry.remove_missing(&present).await.len();
        }

        summary.elapsed = started.elapsed();
        info!(
            discovered = summary.discovered,
            new = summary.authenticated,
            rejected = summary.rejected,
            failed = summary.failed,
            removed = summary.removed,
            total = self.registry.device_count(),
            emeter = self.registry.emeter_count(),
            elapsed_ms = summary.elapsed.as_millis(),
            "discovery complete"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for Discoverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discoverer")
            .field("config", &self.config)
            .field("keep_missing_devices", &self.keep_missing_devices)
            .finish_non_exhaustive()
    }
}
