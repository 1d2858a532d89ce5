use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::error::InfluxError;

/// File name of the emeter JSON mirror inside `output_dir`.
pub const EMETER_OUTPUT_FILE: &str = "emeter_output.json";
/// File name of the sysinfo JSON mirror inside `output_dir`.
pub const SYSINFO_OUTPUT_FILE: &str = "sysinfo_output.json";

/// Connection settings for an InfluxDB v2 server.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Server root, e.g. `http://influxdb:8086`.
    pub url: Url,
    pub token: SecretString,
    pub org: String,
    pub bucket: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Mirror every batch as JSON under `output_dir`.
    pub write_to_file: bool,
    pub output_dir: PathBuf,
}

impl InfluxConfig {
    pub fn new(
        url: Url,
        token: SecretString,
        org: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            url,
            token,
            org: org.into(),
            bucket: bucket.into(),
            timeout: Duration::from_secs(10),
            write_to_file: false,
            output_dir: PathBuf::from("output"),
        }
    }

    /// `{url}/api/v2/write?org=..&bucket=..&precision=ns`
    pub fn write_url(&self) -> Result<Url, InfluxError> {
        let mut url = self.endpoint("api/v2/write")?;
        url.query_pairs_mut()
            .append_pair("org", &self.org)
            .append_pair("bucket", &self.bucket)
            .append_pair("precision", "ns");
        Ok(url)
    }

    /// `{url}/health`
    pub fn health_url(&self) -> Result<Url, InfluxError> {
        self.endpoint("health")
    }

    pub fn emeter_output_path(&self) -> PathBuf {
        self.output_dir.join(EMETER_OUTPUT_FILE)
    }

    pub fn sysinfo_output_path(&self) -> PathBuf {
        self.output_dir.join(SYSINFO_OUTPUT_FILE)
    }

    fn endpoint(&self, path: &str) -> Result<Url, InfluxError> {
        let base = self.url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}/{path}"))?)
    }
}
