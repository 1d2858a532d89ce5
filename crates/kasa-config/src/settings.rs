// ── Collector settings ──
//
// One flat struct mirroring the `KASA_COLLECTOR_*` environment surface.
// Field names are the lowercase environment suffixes, so the same keys
// work in TOML and in the environment.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use kasa_core::{AuthConfig, CollectorConfig, Credentials, DiscoveryConfig, RetryConfig, RuleSet};
use kasa_influx::InfluxConfig;

use crate::de;
use crate::{ConfigError, ENV_PREFIX};

/// Effective collector settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    // ── Storage ─────────────────────────────────────────────────────
    #[serde(deserialize_with = "de::opt_text")]
    pub influxdb_url: Option<String>,

    #[serde(deserialize_with = "de::opt_secret", skip_serializing)]
    pub influxdb_token: Option<SecretString>,

    #[serde(deserialize_with = "de::opt_text")]
    pub influxdb_org: Option<String>,

    #[serde(deserialize_with = "de::opt_text")]
    pub influxdb_bucket: Option<String>,

    #[serde(deserialize_with = "de::seconds", serialize_with = "de::ser_seconds")]
    pub influxdb_timeout: Duration,

    #[serde(deserialize_with = "de::flag")]
    pub write_to_file: bool,

    #[serde(deserialize_with = "de::text")]
    pub output_dir: String,

    // ── Devices ─────────────────────────────────────────────────────
    /// Broadcast discovery. When off, only `device_hosts` are polled.
    #[serde(deserialize_with = "de::flag")]
    pub device_discovery: bool,

    /// Hosts added at startup: a TOML array or a comma-separated string.
    #[serde(deserialize_with = "de::hosts")]
    pub device_hosts: Vec<String>,

    #[serde(deserialize_with = "de::flag")]
    pub use_credentials: bool,

    #[serde(deserialize_with = "de::opt_text")]
    pub tplink_username: Option<String>,

    #[serde(deserialize_with = "de::opt_secret", skip_serializing)]
    pub tplink_password: Option<SecretString>,

    #[serde(deserialize_with = "de::flag")]
    pub keep_missing_devices: bool,

    // ── Timing ──────────────────────────────────────────────────────
    #[serde(deserialize_with = "de::seconds", serialize_with = "de::ser_seconds")]
    pub device_discovery_interval: Duration,

    #[serde(deserialize_with = "de::seconds", serialize_with = "de::ser_seconds")]
    pub discovery_timeout: Duration,

    #[serde(deserialize_with = "de::count")]
    pub discovery_packets: u32,

    #[serde(deserialize_with = "de::seconds", serialize_with = "de::ser_seconds")]
    pub data_fetch_interval: Duration,

    #[serde(deserialize_with = "de::seconds", serialize_with = "de::ser_seconds")]
    pub sysinfo_fetch_interval: Duration,

    #[serde(deserialize_with = "de::count")]
    pub fetch_max_retries: u32,

    #[serde(deserialize_with = "de::seconds", serialize_with = "de::ser_seconds")]
    pub fetch_retry_delay: Duration,

    #[serde(deserialize_with = "de::seconds", serialize_with = "de::ser_seconds")]
    pub fetch_max_retry_delay: Duration,

    #[serde(deserialize_with = "de::flag")]
    pub fetch_retry_exponential: bool,

    /// Per-attempt ceiling on one device fetch.
    #[serde(deserialize_with = "de::seconds", serialize_with = "de::ser_seconds")]
    pub fetch_timeout: Duration,

    #[serde(deserialize_with = "de::count")]
    pub auth_max_retries: u32,

    #[serde(deserialize_with = "de::seconds", serialize_with = "de::ser_seconds")]
    pub auth_timeout: Duration,

    #[serde(deserialize_with = "de::seconds", serialize_with = "de::ser_seconds")]
    pub hostname_cache_ttl: Duration,

    #[serde(deserialize_with = "de::seconds", serialize_with = "de::ser_seconds")]
    pub shutdown_timeout: Duration,

    #[serde(deserialize_with = "de::seconds", serialize_with = "de::ser_seconds")]
    pub health_check_max_age: Duration,

    // ── Processing ──────────────────────────────────────────────────
    /// Sysinfo normalization: `none`, `v1` or `v2`.
    #[serde(deserialize_with = "de::text")]
    pub sysinfo_rules: String,

    #[serde(deserialize_with = "de::text")]
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            influxdb_url: None,
            influxdb_token: None,
            influxdb_org: None,
            influxdb_bucket: None,
            influxdb_timeout: Duration::from_secs(10),
            write_to_file: false,
            output_dir: "output".into(),
            device_discovery: true,
            device_hosts: Vec::new(),
            use_credentials: false,
            tplink_username: None,
            tplink_password: None,
            keep_missing_devices: true,
            device_discovery_interval: Duration::from_secs(300),
            discovery_timeout: Duration::from_secs(5),
            discovery_packets: 3,
            data_fetch_interval: Duration::from_secs(15),
            sysinfo_fetch_interval: Duration::from_secs(60),
            fetch_max_retries: 5,
            fetch_retry_delay: Duration::from_secs(1),
            fetch_max_retry_delay: Duration::from_secs(60),
            fetch_retry_exponential: true,
            fetch_timeout: Duration::from_secs(10),
            auth_max_retries: 3,
            auth_timeout: Duration::from_secs(10),
            hostname_cache_ttl: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(10),
            health_check_max_age: Duration::from_secs(120),
            sysinfo_rules: "v1".into(),
            log_level: "info".into(),
        }
    }
}

/// Environment variable name for a settings key.
pub fn env_name(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())
}

/// Render a secret as `abcd****wxyz`. Short secrets are fully masked.
pub fn obfuscate(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".into();
    }
    let head: String = chars.iter().take(4).collect();
    let tail: String = chars.iter().skip(chars.len() - 4).collect();
    format!("{head}****{tail}")
}

impl Settings {
    /// Check required settings and value ranges.
    ///
    /// Missing settings are reported together, by environment name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        let required = [
            ("influxdb_url", self.influxdb_url.is_some()),
            ("influxdb_token", self.influxdb_token.is_some()),
            ("influxdb_org", self.influxdb_org.is_some()),
            ("influxdb_bucket", self.influxdb_bucket.is_some()),
        ];
        for (key, present) in required {
            if !present {
                missing.push(env_name(key));
            }
        }
        if self.use_credentials {
            if self.tplink_username.is_none() {
                missing.push(env_name("tplink_username"));
            }
            if self.tplink_password.is_none() {
                missing.push(env_name("tplink_password"));
            }
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing { names: missing });
        }

        self.influx_url()?;

        let positive = [
            ("data_fetch_interval", self.data_fetch_interval),
            ("sysinfo_fetch_interval", self.sysinfo_fetch_interval),
            ("device_discovery_interval", self.device_discovery_interval),
            ("discovery_timeout", self.discovery_timeout),
            ("fetch_timeout", self.fetch_timeout),
            ("auth_timeout", self.auth_timeout),
            ("influxdb_timeout", self.influxdb_timeout),
        ];
        for (key, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::Validation {
                    field: key.into(),
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.discovery_packets == 0 {
            return Err(ConfigError::Validation {
                field: "discovery_packets".into(),
                reason: "must be at least 1".into(),
            });
        }

        self.rule_set()?;
        Ok(())
    }

    fn influx_url(&self) -> Result<Url, ConfigError> {
        let raw = self.influxdb_url.as_deref().ok_or_else(|| ConfigError::Missing {
            names: vec![env_name("influxdb_url")],
        })?;
        let url = Url::parse(raw).map_err(|e| ConfigError::Validation {
            field: "influxdb_url".into(),
            reason: format!("invalid URL '{raw}': {e}"),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation {
                field: "influxdb_url".into(),
                reason: format!("expected an http or https URL, got '{raw}'"),
            });
        }
        Ok(url)
    }

    /// Sysinfo rule set named by `sysinfo_rules`.
    pub fn rule_set(&self) -> Result<RuleSet, ConfigError> {
        RuleSet::by_name(&self.sysinfo_rules).ok_or_else(|| ConfigError::Validation {
            field: "sysinfo_rules".into(),
            reason: format!("expected 'none', 'v1' or 'v2', got '{}'", self.sysinfo_rules),
        })
    }

    /// Device credentials, when enabled and complete.
    pub fn credentials(&self) -> Option<Credentials> {
        if !self.use_credentials {
            return None;
        }
        match (&self.tplink_username, &self.tplink_password) {
            (Some(user), Some(pass)) => Some(Credentials::new(user.clone(), pass.expose_secret())),
            _ => None,
        }
    }

    /// Translate into the collector core configuration.
    pub fn to_collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            discovery: DiscoveryConfig {
                enabled: self.device_discovery,
                interval: self.device_discovery_interval,
                timeout: self.discovery_timeout,
                packets: self.discovery_packets,
            },
            emeter_interval: self.data_fetch_interval,
            sysinfo_interval: self.sysinfo_fetch_interval,
            fetch_retry: RetryConfig {
                max_retries: self.fetch_max_retries,
                base_delay: self.fetch_retry_delay,
                exponential: self.fetch_retry_exponential,
                max_delay: self.fetch_max_retry_delay,
            },
            fetch_timeout: self.fetch_timeout,
            auth: AuthConfig {
                max_retries: self.auth_max_retries,
                timeout: self.auth_timeout,
            },
            keep_missing_devices: self.keep_missing_devices,
            shutdown_timeout: self.shutdown_timeout,
            manual_hosts: self.device_hosts.clone(),
            credentials: self.credentials(),
            hostname_ttl: self.hostname_cache_ttl,
        }
    }

    /// Translate into the InfluxDB sink configuration.
    pub fn to_influx_config(&self) -> Result<InfluxConfig, ConfigError> {
        let url = self.influx_url()?;
        let (Some(token), Some(org), Some(bucket)) =
            (&self.influxdb_token, &self.influxdb_org, &self.influxdb_bucket)
        else {
            return Err(ConfigError::Missing {
                names: ["influxdb_token", "influxdb_org", "influxdb_bucket"]
                    .iter()
                    .map(|k| env_name(k))
                    .collect(),
            });
        };
        let mut config = InfluxConfig::new(url, token.clone(), org.clone(), bucket.clone());
        config.timeout = self.influxdb_timeout;
        config.write_to_file = self.write_to_file;
        config.output_dir = PathBuf::from(&self.output_dir);
        Ok(config)
    }

    /// Emeter mirror file checked by the health command.
    pub fn emeter_output_path(&self) -> PathBuf {
        PathBuf::from(&self.output_dir).join(kasa_influx::EMETER_OUTPUT_FILE)
    }

    /// One-line storage summary with the token obfuscated.
    pub fn storage_summary(&self) -> String {
        format!(
            "url={} org={} bucket={} token={}",
            self.influxdb_url.as_deref().unwrap_or("<unset>"),
            self.influxdb_org.as_deref().unwrap_or("<unset>"),
            self.influxdb_bucket.as_deref().unwrap_or("<unset>"),
            self.influxdb_token
                .as_ref()
                .map_or_else(|| "<unset>".into(), |t| obfuscate(t.expose_secret())),
        )
    }

    /// Every effective setting as `(env name, display value)`, secrets
    /// obfuscated.
    pub fn describe(&self) -> Vec<(String, String)> {
        let secs = |d: Duration| humantime::format_duration(d).to_string();
        let opt = |v: &Option<String>| v.clone().unwrap_or_else(|| "<unset>".into());
        let secret = |v: &Option<SecretString>| {
            v.as_ref()
                .map_or_else(|| "<unset>".into(), |s| obfuscate(s.expose_secret()))
        };

        let rows: Vec<(&str, String)> = vec![
            ("influxdb_url", opt(&self.influxdb_url)),
            ("influxdb_token", secret(&self.influxdb_token)),
            ("influxdb_org", opt(&self.influxdb_org)),
            ("influxdb_bucket", opt(&self.influxdb_bucket)),
            ("influxdb_timeout", secs(self.influxdb_timeout)),
            ("write_to_file", self.write_to_file.to_string()),
            ("output_dir", self.output_dir.clone()),
            ("device_discovery", self.device_discovery.to_string()),
            ("device_hosts", self.device_hosts.join(",")),
            ("use_credentials", self.use_credentials.to_string()),
            ("tplink_username", opt(&self.tplink_username)),
            ("tplink_password", secret(&self.tplink_password)),
            ("keep_missing_devices", self.keep_missing_devices.to_string()),
            ("device_discovery_interval", secs(self.device_discovery_interval)),
            ("discovery_timeout", secs(self.discovery_timeout)),
            ("discovery_packets", self.discovery_packets.to_string()),
            ("data_fetch_interval", secs(self.data_fetch_interval)),
            ("sysinfo_fetch_interval", secs(self.sysinfo_fetch_interval)),
            ("fetch_max_retries", self.fetch_max_retries.to_string()),
            ("fetch_retry_delay", secs(self.fetch_retry_delay)),
            ("fetch_max_retry_delay", secs(self.fetch_max_retry_delay)),
            ("fetch_retry_exponential", self.fetch_retry_exponential.to_string()),
            ("fetch_timeout", secs(self.fetch_timeout)),
            ("auth_max_retries", self.auth_max_retries.to_string()),
            ("auth_timeout", secs(self.auth_timeout)),
            ("hostname_cache_ttl", secs(self.hostname_cache_ttl)),
            ("shutdown_timeout", secs(self.shutdown_timeout)),
            ("health_check_max_age", secs(self.health_check_max_age)),
            ("sysinfo_rules", self.sysinfo_rules.clone()),
            ("log_level", self.log_level.clone()),
        ];
        rows.into_iter().map(|(k, v)| (env_name(k), v)).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn complete() -> Settings {
        Settings {
            influxdb_url: Some("http://influxdb:8086".into()),
            influxdb_token: Some(SecretString::from("abcdefghijklmnopwxyz")),
            influxdb_org: Some("home".into()),
            influxdb_bucket: Some("kasa".into()),
            ..Settings::default()
        }
    }

    #[test]
    fn obfuscate_keeps_four_chars_each_side() {
        assert_eq!(obfuscate("abcdefghijklmnopwxyz"), "abcd****wxyz");
        assert_eq!(obfuscate("short"), "****");
        assert_eq!(obfuscate("exactly8"), "****");
    }

    #[test]
    fn validate_lists_every_missing_setting() {
        let err = Settings::default().validate().unwrap_err();
        let ConfigError::Missing { names } = err else {
            panic!("expected Missing, got {err:?}");
        };
        assert_eq!(
            names,
            vec![
                "KASA_COLLECTOR_INFLUXDB_URL",
                "KASA_COLLECTOR_INFLUXDB_TOKEN",
                "KASA_COLLECTOR_INFLUXDB_ORG",
                "KASA_COLLECTOR_INFLUXDB_BUCKET",
            ]
        );
    }

    #[test]
    fn credentials_are_required_only_when_enabled() {
        let mut settings = complete();
        settings.validate().unwrap();
        assert!(settings.credentials().is_none());

        settings.use_credentials = true;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("KASA_COLLECTOR_TPLINK_PASSWORD"));

        settings.tplink_username = Some("me@example.com".into());
        settings.tplink_password = Some(SecretString::from("hunter22"));
        settings.validate().unwrap();
        assert_eq!(settings.credentials().unwrap().username, "me@example.com");
    }

    #[test]
    fn zero_interval_is_rejected() {
        let settings = Settings {
            data_fetch_interval: Duration::ZERO,
            ..complete()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Validation { ref field, .. }) if field == "data_fetch_interval"
        ));
    }

    #[test]
    fn unknown_rule_set_is_rejected() {
        let settings = Settings {
            sysinfo_rules: "v9".into(),
            ..complete()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn non_http_url_is_rejected() {
        let settings = Settings {
            influxdb_url: Some("ftp://influxdb".into()),
            ..complete()
        };
        assert!(matches!(settings.validate(), Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn collector_config_carries_timing() {
        let settings = Settings {
            device_hosts: vec!["10.0.0.5".into()],
            device_discovery: false,
            ..complete()
        };
        let config = settings.to_collector_config();
        assert!(!config.discovery.enabled);
        assert_eq!(config.manual_hosts, vec!["10.0.0.5"]);
        assert_eq!(config.emeter_interval, Duration::from_secs(15));
        assert_eq!(config.fetch_retry.max_retries, 5);
        assert_eq!(config.auth.timeout, Duration::from_secs(10));
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
    }

    #[test]
    fn zero_fetch_timeout_is_rejected() {
        let settings = Settings {
            fetch_timeout: Duration::ZERO,
            ..complete()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Validation { ref field, .. }) if field == "fetch_timeout"
        ));
    }

    #[test]
    fn influx_config_carries_mirror_settings() {
        let settings = Settings {
            write_to_file: true,
            output_dir: "/data".into(),
            ..complete()
        };
        let config = settings.to_influx_config().unwrap();
        assert_eq!(config.org, "home");
        assert!(config.write_to_file);
        assert_eq!(config.emeter_output_path(), PathBuf::from("/data/emeter_output.json"));
    }

    #[test]
    fn describe_never_shows_secrets() {
        let rows = complete().describe();
        let token = rows
            .iter()
            .find(|(k, _)| k == "KASA_COLLECTOR_INFLUXDB_TOKEN")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(token, "abcd****wxyz");
        assert!(complete().storage_summary().contains("token=abcd****wxyz"));
    }
}
