//! Device lifecycle and polling core for the Kasa telemetry collector.
//!
//! This crate owns everything between the device protocol and the
//! time-series sink:
//!
//! - **[`Collector`]**: orchestrator. [`start()`](Collector::start) verifies
//!   the sink, adds manual hosts, runs the first discovery pass, then spawns
//!   the emeter loop, the sysinfo loop and periodic discovery.
//!   [`shutdown()`](Collector::shutdown) cancels them within a bounded
//!   timeout, closes the sink and disconnects every device.
//!
//! - **[`DeviceRegistry`]**: the known device set plus its emeter-capable
//!   and polling subsets. Writers are serialized; readers take wait-free
//!   snapshots.
//!
//! - **[`Discoverer`]** / **[`Authenticator`]**: network discovery and the
//!   layered authentication strategy (discovered handle, credentials,
//!   unauthenticated fallback).
//!
//! - **[`Poller`]**: two periodic fan-out loops with per-device retry and
//!   failure isolation.
//!
//! - **[`HostnameCache`]** / **[`RetryPolicy`]**: leaf utilities.
//!
//! The device protocol, the storage sink and the reverse resolver are
//! collaborator traits ([`DeviceProtocol`], [`StorageSink`],
//! [`HostnameResolver`]). [`sim`] provides an in-memory fleet that
//! implements them for tests and dry runs.

pub mod auth;
pub mod collector;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod hostname;
pub mod normalize;
pub mod poller;
pub mod registry;
pub mod retry;
pub mod sim;
pub mod sink;

// ── Primary re-exports ──────────────────────────────────────────────
pub use auth::{AuthOutcome, AuthPath, Authenticator, FailureHint};
pub use collector::{Collector, CollectorBuilder, CollectorState};
pub use config::{AuthConfig, CollectorConfig, Credentials, DiscoveryConfig, RetryConfig};
pub use device::{
    DeviceFamily, DeviceHandle, DeviceKind, DeviceProtocol, DeviceRef, DiscoveryRequest,
    EmeterReading, SysInfo, display_name,
};
pub use discovery::{Discoverer, DiscoverySummary};
pub use error::{CoreError, DeviceError, ErrorKind};
pub use hostname::{CacheStats, HostnameCache, HostnameResolver, SystemResolver};
pub use normalize::{FieldRule, RuleSet, SysinfoTransform};
pub use poller::{CycleReport, FetchOutcome, PollKind, Poller};
pub use registry::{DeviceOrigin, DeviceRecord, DeviceRegistry, InsertOutcome, MergeOutcome};
pub use retry::RetryPolicy;
pub use sink::{
    EmeterBatch, EmeterRecord, EquipmentType, SinkError, StorageSink, SysinfoBatch, SysinfoRecord,
};
