// ── Collector orchestrator ──
//
// Wires the registry, discoverer and poller together and owns the
// background tasks. `start()` and `shutdown()` are the only lifecycle
// transitions; both are safe to call concurrently from clones.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use strum::Display;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::CollectorConfig;
use crate::device::DeviceProtocol;
use crate::discovery::Discoverer;
use crate::error::CoreError;
use crate::hostname::{HostnameCache, HostnameResolver, SystemResolver};
use crate::normalize::{RuleSet, SysinfoTransform};
use crate::poller::Poller;
use crate::registry::DeviceRegistry;
use crate::sink::StorageSink;

/// Lifecycle state of a [`Collector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CollectorState {
    Idle,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Builder for [`Collector`]; collaborators default to the system
/// resolver and the `v1` sysinfo rules.
pub struct CollectorBuilder {
    config: CollectorConfig,
    protocol: Arc<dyn DeviceProtocol>,
    sink: Arc<dyn StorageSink>,
    resolver: Arc<dyn HostnameResolver>,
    transform: Arc<dyn SysinfoTransform>,
}

impl CollectorBuilder {
    pub fn resolver(mut self, resolver: Arc<dyn HostnameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn transform(mut self, transform: Arc<dyn SysinfoTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn build(self) -> Collector {
        let config = self.config;
        let registry = Arc::new(DeviceRegistry::new());
        let hostnames = Arc::new(HostnameCache::new(config.hostname_ttl, self.resolver));
        let authenticator = Arc::new(Authenticator::new(
            Arc::clone(&self.protocol),
            config.credentials.clone(),
            config.auth.clone(),
        ));
        let discoverer = Arc::new(Discoverer::new(
            Arc::clone(&self.protocol),
            Arc::clone(&registry),
            Arc::clone(&authenticator),
            Arc::clone(&hostnames),
            config.discovery.clone(),
            config.keep_missing_devices,
        ));
        let poller = Arc::new(Poller::new(
            Arc::clone(&registry),
            Arc::clone(&self.sink),
            Arc::clone(&hostnames),
            self.transform,
            &config,
        ));
        let (state, _) = watch::channel(CollectorState::Idle);

        Collector {
            inner: Arc::new(CollectorInner {
                config,
                registry,
                hostnames,
                authenticator,
                discoverer,
                poller,
                sink: self.sink,
                state,
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Owns the device lifecycle and the background tasks.
///
/// Cheaply cloneable via `Arc<CollectorInner>`.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<CollectorInner>,
}

struct CollectorInner {
    config: CollectorConfig,
    registry: Arc<DeviceRegistry>,
    hostnames: Arc<HostnameCache>,
    authenticator: Arc<Authenticator>,
    discoverer: Arc<Discoverer>,
    poller: Arc<Poller>,
    sink: Arc<dyn StorageSink>,
    state: watch::Sender<CollectorState>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Collector {
    pub fn builder(
        config: CollectorConfig,
        protocol: Arc<dyn DeviceProtocol>,
        sink: Arc<dyn StorageSink>,
    ) -> CollectorBuilder {
        CollectorBuilder {
            config,
            protocol,
            sink,
            resolver: Arc::new(SystemResolver),
            transform: Arc::new(RuleSet::v1()),
        }
    }

    /// Collector with default collaborators.
    pub fn new(
        config: CollectorConfig,
        protocol: Arc<dyn DeviceProtocol>,
        sink: Arc<dyn StorageSink>,
    ) -> Self {
        Self::builder(config, protocol, sink).build()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Verify the sink, add manual devices, run one discovery pass and
    /// spawn the background loops.
    ///
    /// Only an unreachable sink is fatal. Unreachable devices are logged
    /// and retried by later discovery passes. If `shutdown()` runs while
    /// this is in progress, the loops are never spawned, devices added in
    /// the meantime are disconnected and `Ok(())` is returned.
    pub async fn start(&self) -> Result<(), CoreError> {
        let claimed = self.inner.state.send_if_modified(|state| {
            if *state == CollectorState::Idle {
                *state = CollectorState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(CoreError::InvalidState {
                state: self.state().to_string(),
            });
        }

        let config = &self.inner.config;
        info!(
            emeter_interval = ?config.emeter_interval,
            sysinfo_interval = ?config.sysinfo_interval,
            discovery = config.discovery.enabled,
            discovery_interval = ?config.discovery.interval,
            manual_hosts = config.manual_hosts.len(),
            keep_missing_devices = config.keep_missing_devices,
            credentials = config.credentials.is_some(),
            "starting collector"
        );

        if let Err(e) = self.inner.sink.verify().await {
            error!(error = %e, "storage backend verification failed");
            self.inner.state.send_if_modified(|state| {
                if *state == CollectorState::Starting {
                    *state = CollectorState::Stopped;
                    true
                } else {
                    false
                }
            });
            return Err(CoreError::Storage(e));
        }

        let (added, failed) = self
            .inner
            .registry
            .initialize_manual_devices(
                &config.manual_hosts,
                &self.inner.authenticator,
                &self.inner.hostnames,
            )
            .await;
        if !config.manual_hosts.is_empty() {
            info!(added, failed, "manual devices initialized");
        }

        if self.inner.discoverer.enabled() && !self.inner.cancel.is_cancelled() {
            if let Err(e) = self.inner.discoverer.discover_devices().await {
                warn!(error = %e, "initial discovery failed");
            }
        }

        if !self.spawn_tasks().await {
            // Devices added after shutdown's disconnect pass.
            info!("shutdown requested during startup");
            let failures = self.inner.registry.disconnect_all().await;
            if failures > 0 {
                warn!(failures, "some devices failed to disconnect");
            }
            return Ok(());
        }

        if self.inner.registry.device_count() == 0 {
            warn!("no devices found, will keep looking");
        }

        let running = self.inner.state.send_if_modified(|state| {
            if *state == CollectorState::Starting {
                *state = CollectorState::Running;
                true
            } else {
                false
            }
        });
        if running {
            info!(
                devices = self.inner.registry.device_count(),
                emeter = self.inner.registry.emeter_count(),
                "collector running"
            );
        }
        Ok(())
    }

    /// Spawn the loops unless shutdown has begun. The check happens under
    /// the handle lock, so a concurrent `shutdown()` either sees no
    /// handles or drains all of them.
    async fn spawn_tasks(&self) -> bool {
        let mut handles = self.inner.task_handles.lock().await;
        if self.inner.cancel.is_cancelled() {
            return false;
        }

        let poller = Arc::clone(&self.inner.poller);
        let cancel = self.inner.cancel.child_token();
        handles.push(tokio::spawn(async move {
            poller.run_emeter_loop(cancel).await;
        }));

        let poller = Arc::clone(&self.inner.poller);
        let cancel = self.inner.cancel.child_token();
        handles.push(tokio::spawn(async move {
            poller.run_sysinfo_loop(cancel).await;
        }));

        if self.inner.discoverer.enabled() {
            let collector = self.clone();
            let cancel = self.inner.cancel.child_token();
            handles.push(tokio::spawn(discovery_task(collector, cancel)));
        }
        true
    }

    /// Stop background tasks, close the sink and disconnect every
    /// device. Calls after the first are no-ops.
    pub async fn shutdown(&self) {
        let claimed = self.inner.state.send_if_modified(|state| match state {
            CollectorState::ShuttingDown | CollectorState::Stopped => false,
            _ => {
                *state = CollectorState::ShuttingDown;
                true
            }
        });
        if !claimed {
            debug!("shutdown already in progress");
            return;
        }
        info!("shutting down collector");

        self.inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.inner.task_handles.lock().await.drain(..).collect();
        join_or_abort(handles, self.inner.config.shutdown_timeout).await;

        self.inner.sink.close().await;

        let failures = self.inner.registry.disconnect_all().await;
        if failures > 0 {
            warn!(failures, "some devices failed to disconnect");
        }

        self.inner.state.send_replace(CollectorState::Stopped);
        info!("collector stopped");
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn state(&self) -> CollectorState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CollectorState> {
        self.inner.state.subscribe()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("state", &self.state())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Wait for `handles` up to `timeout`, then abort the stragglers.
/// Returns `false` when the timeout expired.
async fn join_or_abort(handles: Vec<JoinHandle<()>>, timeout: Duration) -> bool {
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
    let joined = join_all(handles);
    tokio::pin!(joined);

    let (finished, results) = match tokio::time::timeout(timeout, &mut joined).await {
        Ok(results) => (true, results),
        Err(_) => {
            warn!(?timeout, "background tasks did not stop in time, aborting");
            for abort in &aborts {
                abort.abort();
            }
            (false, joined.await)
        }
    };
    for result in results {
        if let Err(e) = result {
            if !e.is_cancelled() {
                warn!(error = %e, "background task ended abnormally");
            }
        }
    }
    finished
}

/// Periodic discovery. The first pass already ran during `start()`, so
/// this waits one interval before each pass.
async fn discovery_task(collector: Collector, cancel: CancellationToken) {
    let interval: Duration = collector.inner.discoverer.interval();
    info!(?interval, "periodic discovery started");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        let pass = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            pass = collector.inner.discoverer.discover_devices() => pass,
        };
        if let Err(e) = pass {
            warn!(error = %e, "periodic discovery failed");
        }

        let evicted = collector.inner.hostnames.clear_expired().await;
        if evicted > 0 {
            debug!(evicted, "swept hostname cache");
        }
    }

    info!("periodic discovery stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sim::{RecordingSink, SimulatedDevice, SimulatedHost, SimulatedProtocol, StaticResolver};

    fn collector(protocol: Arc<SimulatedProtocol>, sink: Arc<RecordingSink>) -> Collector {
        let config = CollectorConfig {
            emeter_interval: Duration::from_secs(15),
            sysinfo_interval: Duration::from_secs(60),
            ..CollectorConfig::default()
        };
        Collector::builder(config, protocol, sink)
            .resolver(Arc::new(StaticResolver::new()))
            .build()
    }

    #[tokio::test]
    async fn unreachable_sink_is_fatal() {
        let protocol = Arc::new(SimulatedProtocol::new());
        let sink = Arc::new(RecordingSink::unreachable("connection refused"));
        let collector = collector(protocol.clone(), sink);

        let err = collector.start().await.unwrap_err();

        assert!(matches!(err, CoreError::Storage(_)));
        assert_eq!(collector.state(), CollectorState::Stopped);
        assert_eq!(protocol.discover_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_rejected() {
        let protocol = Arc::new(SimulatedProtocol::new());
        let collector = collector(protocol, Arc::new(RecordingSink::new()));

        collector.start().await.unwrap();
        assert!(matches!(
            collector.start().await,
            Err(CoreError::InvalidState { .. })
        ));
        collector.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_releases_everything() {
        let device = SimulatedDevice::plug("10.0.0.5", "Kettle")
            .with_emeter_power(1500.0)
            .into_ref();
        let protocol = Arc::new(SimulatedProtocol::new().with(SimulatedHost::new(device.clone())));
        let sink = Arc::new(RecordingSink::new());
        let collector = collector(protocol, sink.clone());

        collector.start().await.unwrap();
        assert_eq!(collector.state(), CollectorState::Running);
        tokio::time::sleep(Duration::from_secs(1)).await;

        collector.shutdown().await;
        collector.shutdown().await;

        assert_eq!(collector.state(), CollectorState::Stopped);
        assert_eq!(sink.close_calls(), 1);
        assert_eq!(device.disconnect_calls(), 1);
        assert_eq!(collector.registry().device_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_task_is_aborted_after_the_timeout() {
        let held = Arc::new(());
        let stuck = tokio::spawn({
            let held = held.clone();
            async move {
                let _held = held;
                std::future::pending::<()>().await;
            }
        });
        let done = tokio::spawn(async {});

        let started = tokio::time::Instant::now();
        let finished = join_or_abort(vec![stuck, done], Duration::from_secs(10)).await;

        assert!(!finished);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(11), "{elapsed:?}");
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_tasks_join_without_abort() {
        let handles = vec![tokio::spawn(async {}), tokio::spawn(async {})];
        assert!(join_or_abort(handles, Duration::from_secs(10)).await);
    }
}
