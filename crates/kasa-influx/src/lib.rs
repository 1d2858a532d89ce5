//! InfluxDB v2 storage sink for the Kasa telemetry collector.
//!
//! [`InfluxSink`] implements [`kasa_core::StorageSink`]: emeter and
//! sysinfo batches are rendered as line protocol ([`Point`]) and posted
//! to `/api/v2/write`, optionally mirrored to JSON files for the health
//! check. Write failures are logged and dropped; only
//! [`verify()`](kasa_core::StorageSink::verify) reports errors.

pub mod config;
pub mod error;
pub mod mirror;
pub mod point;
pub mod sink;

pub use config::{EMETER_OUTPUT_FILE, InfluxConfig, SYSINFO_OUTPUT_FILE};
pub use error::InfluxError;
pub use mirror::FileMirror;
pub use point::{FieldValue, Point};
pub use sink::{HealthReport, InfluxSink};
