// ── Core error types ──
//
// `DeviceError` is the failure vocabulary of the device protocol
// collaborator. The core never matches on message text: every variant
// maps onto one `ErrorKind`, which drives logging and the
// authentication state machine. `CoreError` is reserved for failures
// that terminate startup.

use std::time::Duration;

use strum::{Display, IntoStaticStr};
use thiserror::Error;

use crate::sink::SinkError;

/// Coarse classification of a [`DeviceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused or reset, timeout, name resolution failure.
    Network,
    /// Challenge or auth-required response.
    Credential,
    /// Device family that cannot be served by the available protocol.
    Unsupported,
    /// Malformed or missing fields in a device response.
    Data,
    /// Anything else.
    Unexpected,
}

/// Failure reported by a device handle or the device protocol.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    // ── Network ──────────────────────────────────────────────────────
    #[error("cannot connect to {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("connection reset by {host}")]
    ConnectionReset { host: String },

    #[error("{operation} on {host} timed out after {timeout:?}")]
    Timeout {
        host: String,
        operation: String,
        timeout: Duration,
    },

    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    // ── Credentials ──────────────────────────────────────────────────
    #[error("{host} rejected authentication: {message}")]
    Authentication { host: String, message: String },

    // ── Protocol ─────────────────────────────────────────────────────
    #[error("{host} requires unsupported protocol: {reason}")]
    Unsupported { host: String, reason: String },

    // ── Data ─────────────────────────────────────────────────────────
    #[error("invalid data from {host}: {message}")]
    InvalidData { host: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. }
            | Self::ConnectionReset { .. }
            | Self::Timeout { .. }
            | Self::Resolve { .. } => ErrorKind::Network,
            Self::Authentication { .. } => ErrorKind::Credential,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::InvalidData { .. } => ErrorKind::Data,
            Self::Other(_) => ErrorKind::Unexpected,
        }
    }

    /// Returns `true` for failures worth retrying: network errors and
    /// anything uncategorized.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Unexpected)
    }

    /// Returns `true` if retrying with the same credentials is pointless.
    pub fn is_credential(&self) -> bool {
        self.kind() == ErrorKind::Credential
    }

    /// Host the failure refers to, when known.
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Connection { host, .. }
            | Self::ConnectionReset { host }
            | Self::Timeout { host, .. }
            | Self::Resolve { host, .. }
            | Self::Authentication { host, .. }
            | Self::Unsupported { host, .. }
            | Self::InvalidData { host, .. } => Some(host),
            Self::Other(_) => None,
        }
    }

    pub(crate) fn timeout(host: &str, operation: &str, timeout: Duration) -> Self {
        Self::Timeout {
            host: host.to_owned(),
            operation: operation.to_owned(),
            timeout,
        }
    }

    pub(crate) fn invalid_data(host: &str, message: impl Into<String>) -> Self {
        Self::InvalidData {
            host: host.to_owned(),
            message: message.into(),
        }
    }
}

/// Errors that stop the collector from starting.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("storage backend unavailable: {0}")]
    Storage(#[from] SinkError),

    #[error("collector is already {state}")]
    InvalidState { state: String },
}
