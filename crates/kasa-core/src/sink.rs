// ── Storage sink collaborator ──
//
// The poller hands each successful fetch to a `StorageSink` as a batch
// keyed by IP. Sinks absorb their own write failures: the `process_*`
// methods return nothing, so a flaky backend can never break a cycle.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::device::SysInfo;

/// Tag distinguishing whole devices from child outlets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EquipmentType {
    Device,
    Plug,
}

/// One emeter reading, integer-valued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmeterRecord {
    pub ip: String,
    pub device_alias: String,
    pub dns_name: String,
    pub equipment_type: EquipmentType,
    /// Child outlet alias, for strip outlets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plug_alias: Option<String>,
    /// 1-based outlet position, for strip outlets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plug_index: Option<usize>,
    pub emeter: BTreeMap<String, i64>,
}

/// One system-information document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SysinfoRecord {
    pub ip: String,
    pub device_alias: String,
    pub dns_name: String,
    pub equipment_type: EquipmentType,
    pub sysinfo: SysInfo,
}

/// Emeter records keyed by IP.
pub type EmeterBatch = BTreeMap<String, EmeterRecord>;

/// Sysinfo records keyed by IP.
pub type SysinfoBatch = BTreeMap<String, SysinfoRecord>;

/// Sink reachability failure, reported by [`StorageSink::verify`].
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("cannot reach {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("{endpoint} reported unhealthy status: {status}")]
    Unhealthy { endpoint: String, status: String },

    #[error("sink is closed")]
    Closed,
}

/// Time-series storage consumed by the poller.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Startup reachability check. Failure is fatal to the collector.
    async fn verify(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn process_emeter_data(&self, batch: EmeterBatch);

    async fn process_sysinfo_data(&self, batch: SysinfoBatch);

    /// Flush and release resources. Later writes are discarded.
    async fn close(&self);
}
