//! CLI error types with miette diagnostics.
//!
//! Maps config, core and sink failures into user-facing errors with
//! actionable help text and the process exit code.

use miette::Diagnostic;
use thiserror::Error;

use kasa_config::ConfigError;
use kasa_core::{CoreError, SinkError};
use kasa_influx::InfluxError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONNECTION: i32 = 7;
    pub const UNHEALTHY: i32 = 9;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Missing required settings: {names}")]
    #[diagnostic(
        code(kasa::config_missing),
        help(
            "Set them in the environment or in the settings file.\n\
             Example: export KASA_COLLECTOR_INFLUXDB_URL=http://influxdb:8086"
        )
    )]
    ConfigMissing { names: String },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(kasa::validation))]
    Validation { field: String, reason: String },

    #[error("Settings file not found: {path}")]
    #[diagnostic(
        code(kasa::no_config),
        help("Pass an existing file with --config, or omit it to use the environment only.")
    )]
    NoConfig { path: String },

    #[error(transparent)]
    #[diagnostic(code(kasa::config))]
    Config(Box<figment::Error>),

    // ── Storage ──────────────────────────────────────────────────────
    #[error("Could not reach InfluxDB at {url}: {reason}")]
    #[diagnostic(
        code(kasa::storage_unreachable),
        help("Check KASA_COLLECTOR_INFLUXDB_URL and that InfluxDB is running.")
    )]
    StorageUnreachable { url: String, reason: String },

    #[error("InfluxDB at {url} is not healthy: {status}")]
    #[diagnostic(
        code(kasa::storage_unhealthy),
        help("Check the InfluxDB logs, then verify the token, org and bucket.")
    )]
    StorageUnhealthy { url: String, status: String },

    #[error("InfluxDB client error: {0}")]
    #[diagnostic(code(kasa::influx))]
    Influx(#[from] InfluxError),

    // ── Collector ────────────────────────────────────────────────────
    #[error("No device protocol backend is available")]
    #[diagnostic(
        code(kasa::no_backend),
        help("This build cannot talk to physical devices. Use `kasa-collector run --simulate`.")
    )]
    NoProtocolBackend,

    #[error("Collector error: {message}")]
    #[diagnostic(code(kasa::collector))]
    Collector { message: String },

    // ── Health ───────────────────────────────────────────────────────
    #[error("Health check failed: {reason}")]
    #[diagnostic(code(kasa::unhealthy))]
    Unhealthy { reason: String },
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigMissing { .. }
            | Self::Validation { .. }
            | Self::NoConfig { .. }
            | Self::Config(_) => exit_code::USAGE,
            Self::StorageUnreachable { .. } | Self::StorageUnhealthy { .. } => exit_code::CONNECTION,
            Self::Unhealthy { .. } => exit_code::UNHEALTHY,
            Self::Influx(_) | Self::NoProtocolBackend | Self::Collector { .. } => exit_code::GENERAL,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Missing { names } => Self::ConfigMissing {
                names: names.join(", "),
            },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::NotFound(path) => Self::NoConfig {
                path: path.display().to_string(),
            },
            ConfigError::Figment(err) => Self::Config(err),
        }
    }
}

impl From<SinkError> for CliError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Unreachable { endpoint, reason } => Self::StorageUnreachable {
                url: endpoint,
                reason,
            },
            SinkError::Unhealthy { endpoint, status } => Self::StorageUnhealthy {
                url: endpoint,
                status,
            },
            SinkError::Closed => Self::Collector {
                message: SinkError::Closed.to_string(),
            },
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Storage(sink) => sink.into(),
            other @ CoreError::InvalidState { .. } => Self::Collector {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_usage_errors() {
        let err: CliError = ConfigError::Missing {
            names: vec!["KASA_COLLECTOR_INFLUXDB_URL".into()],
        }
        .into();
        assert_eq!(err.exit_code(), exit_code::USAGE);
        assert!(err.to_string().contains("KASA_COLLECTOR_INFLUXDB_URL"));
    }

    #[test]
    fn unreachable_storage_is_a_connection_error() {
        let err: CliError = CoreError::Storage(SinkError::Unreachable {
            endpoint: "http://influxdb:8086/".into(),
            reason: "connection refused".into(),
        })
        .into();
        assert_eq!(err.exit_code(), exit_code::CONNECTION);
    }

    #[test]
    fn unhealthy_maps_to_nine() {
        let err = CliError::Unhealthy {
            reason: "stale data".into(),
        };
        assert_eq!(err.exit_code(), exit_code::UNHEALTHY);
    }
}
