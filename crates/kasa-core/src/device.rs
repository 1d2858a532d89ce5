// ── Device protocol collaborator ──
//
// The collector does not speak the Kasa wire protocols itself. It talks
// to devices through two object-safe traits: `DeviceProtocol` finds and
// opens devices, `DeviceHandle` is one opened device. Readings are only
// valid after a successful `update()`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use strum::{Display, EnumString};

use crate::config::Credentials;
use crate::error::DeviceError;

/// Shared, thread-safe device handle.
pub type DeviceRef = Arc<dyn DeviceHandle>;

/// Instantaneous emeter values keyed by protocol field name
/// (`power_mw`, `voltage_mv`, `current_ma`, `total_wh`, ...).
pub type EmeterReading = BTreeMap<String, f64>;

/// Raw system-information document as reported by the device.
pub type SysInfo = serde_json::Map<String, serde_json::Value>;

/// Topology of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceKind {
    /// Single plug or switch.
    SimpleDevice,
    /// Power strip exposing child outlets.
    MultiOutletStrip,
}

/// Protocol generation a handle speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceFamily {
    /// Classic local protocol, usually unauthenticated.
    Legacy,
    /// Newer authenticated protocol. Must validate on the discovered
    /// handle; a fresh connection is never attempted.
    Smart,
    Unknown,
}

/// Parameters for a discovery broadcast.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub timeout: Duration,
    pub packets: u32,
    pub credentials: Option<Credentials>,
}

/// One opened device.
///
/// Identity accessors are cheap and synchronous. `alias` and `model`
/// may be unknown until the first successful `update()`.
#[async_trait]
pub trait DeviceHandle: Send + Sync + fmt::Debug {
    fn host(&self) -> &str;

    fn alias(&self) -> Option<String>;

    fn model(&self) -> Option<String>;

    fn family(&self) -> DeviceFamily;

    fn kind(&self) -> DeviceKind;

    fn has_emeter(&self) -> bool;

    /// Refresh cached state from the device.
    async fn update(&self) -> Result<(), DeviceError>;

    /// Instantaneous power reading from the last `update()`.
    fn emeter_realtime(&self) -> Result<EmeterReading, DeviceError>;

    /// System information from the last `update()`.
    fn sys_info(&self) -> Result<SysInfo, DeviceError>;

    /// Child outlets. Empty for simple devices.
    fn children(&self) -> Vec<DeviceRef>;

    async fn disconnect(&self) -> Result<(), DeviceError>;
}

/// Finds and opens devices.
#[async_trait]
pub trait DeviceProtocol: Send + Sync {
    /// Broadcast discovery. Returns candidate handles keyed by IP. The
    /// handles are not yet validated.
    async fn discover(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<HashMap<String, DeviceRef>, DeviceError>;

    /// Unicast discovery of a single host.
    async fn discover_single(
        &self,
        host: &str,
        credentials: Option<&Credentials>,
    ) -> Result<DeviceRef, DeviceError>;

    /// Open a fresh connection, bypassing discovery.
    async fn connect(
        &self,
        host: &str,
        credentials: Option<&Credentials>,
    ) -> Result<DeviceRef, DeviceError>;
}

/// Human-facing label: alias, then host, then model.
pub fn display_name(handle: &dyn DeviceHandle) -> String {
    handle
        .alias()
        .filter(|alias| !alias.is_empty())
        .or_else(|| Some(handle.host().to_owned()).filter(|host| !host.is_empty()))
        .or_else(|| handle.model().filter(|model| !model.is_empty()))
        .unwrap_or_else(|| "Unknown Device".to_owned())
}
