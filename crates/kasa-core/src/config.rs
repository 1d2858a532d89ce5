// ── Runtime collector configuration ──
//
// These types describe *how* the collector behaves: intervals, retry
// bounds, credentials. They never touch disk or the environment; the
// binary builds a `CollectorConfig` through `kasa-config` and hands it
// in. The core treats it as immutable for the lifetime of the process.

use std::time::Duration;

use secrecy::SecretString;

/// TP-Link cloud account used by devices that require authentication.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }
}

/// Bounds for the per-device fetch retry wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub exponential: bool,
    /// Hard ceiling on any single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            exponential: true,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Network discovery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Pause between periodic discovery passes.
    pub interval: Duration,
    /// How long a single discovery broadcast listens for replies.
    pub timeout: Duration,
    pub packets: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            timeout: Duration::from_secs(5),
            packets: 3,
        }
    }
}

/// Bounds for the credential retry step of device authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub max_retries: u32,
    /// Per-attempt ceiling on connect + refresh.
    pub timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Everything the core needs to run.
///
/// Built by the binary, passed to [`Collector`](crate::Collector) --
/// the core never reads config files.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub discovery: DiscoveryConfig,
    /// Emeter poll cadence.
    pub emeter_interval: Duration,
    /// Sysinfo poll cadence.
    pub sysinfo_interval: Duration,
    pub fetch_retry: RetryConfig,
    /// Per-attempt ceiling on a device refresh during polling.
    pub fetch_timeout: Duration,
    pub auth: AuthConfig,
    /// When `false`, devices absent from a discovery pass are evicted.
    pub keep_missing_devices: bool,
    /// Upper bound on waiting for background tasks during shutdown.
    pub shutdown_timeout: Duration,
    /// Hosts (IPs or hostnames) added regardless of discovery.
    pub manual_hosts: Vec<String>,
    /// Cloud credentials, when the deployment enables them.
    pub credentials: Option<Credentials>,
    /// Reverse-lookup cache lifetime. Zero disables caching.
    pub hostname_ttl: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            emeter_interval: Duration::from_secs(15),
            sysinfo_interval: Duration::from_secs(60),
            fetch_retry: RetryConfig::default(),
            fetch_timeout: Duration::from_secs(10),
            auth: AuthConfig::default(),
            keep_missing_devices: true,
            shutdown_timeout: Duration::from_secs(10),
            manual_hosts: Vec::new(),
            credentials: None,
            hostname_ttl: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn defaults_follow_collector_conventions() {
        let config = CollectorConfig::default();
        assert_eq!(config.emeter_interval, Duration::from_secs(15));
        assert_eq!(config.sysinfo_interval, Duration::from_secs(60));
        assert_eq!(config.discovery.interval, Duration::from_secs(300));
        assert_eq!(config.fetch_retry.max_retries, 5);
        assert!(config.keep_missing_devices);
        assert!(config.credentials.is_none());
    }

    #[test]
    fn credentials_debug_does_not_leak_password() {
        let creds = Credentials::new("user@example.com", "hunter2");
        assert_eq!(creds.password.expose_secret(), "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
