//! Settings for the Kasa telemetry collector.
//!
//! Layers serialized defaults, an optional TOML file and `KASA_COLLECTOR_*`
//! environment variables with figment, validates the result, and
//! translates it into `kasa_core::CollectorConfig` and
//! `kasa_influx::InfluxConfig`.

mod de;
pub mod settings;

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use thiserror::Error;

pub use settings::{Settings, env_name, obfuscate};

/// Prefix shared by every environment variable.
pub const ENV_PREFIX: &str = "KASA_COLLECTOR_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required settings are absent. Lists names, never values.
    #[error("missing required settings: {}", names.join(", "))]
    Missing { names: Vec<String> },

    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Platform config file: e.g. `~/.config/kasa-collector/config.toml`.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("", "", "kasa-collector").map_or_else(
        || PathBuf::from("kasa-collector").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Loading ─────────────────────────────────────────────────────────

/// The layered provider: defaults, then the TOML file, then environment.
///
/// An explicit `path` must exist; the platform default may be absent.
pub fn figment(path: Option<&Path>) -> Result<Figment, ConfigError> {
    let file = match path {
        Some(p) if !p.exists() => return Err(ConfigError::NotFound(p.to_path_buf())),
        Some(p) => p.to_path_buf(),
        None => config_path(),
    };

    Ok(Figment::new()
        .merge(Serialized::defaults(Settings::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX)))
}

/// Load settings without validating them.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    Ok(figment(path)?.extract()?)
}

/// Load and validate settings.
pub fn load_validated(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let settings = load_settings(path)?;
    settings.validate()?;
    Ok(settings)
}
