use std::path::PathBuf;

use thiserror::Error;

use kasa_core::SinkError;

/// Errors raised by the InfluxDB client.
///
/// Write failures never leave the sink: they are logged and the batch is
/// dropped. Only `health()`, `write_points()` and construction surface
/// these to callers.
#[derive(Debug, Error)]
pub enum InfluxError {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Failed to build the HTTP client.
    #[error("HTTP client error: {0}")]
    Client(String),

    // ── Server ──────────────────────────────────────────────────────
    /// Non-2xx response, with the body InfluxDB sent back.
    #[error("InfluxDB returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    // ── File mirror ─────────────────────────────────────────────────
    #[error("Failed to write {}: {source}", path.display())]
    Mirror {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    // ── Lifecycle ───────────────────────────────────────────────────
    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl InfluxError {
    /// Returns `true` if the request might succeed when repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
