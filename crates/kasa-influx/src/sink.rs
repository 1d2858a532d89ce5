// InfluxDB v2 storage sink
//
// Wraps `reqwest::Client` with the write and health endpoints. Batches
// from the poller become one POST each; failures are logged and the
// batch dropped so a flaky database never stalls collection.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use kasa_core::{EmeterBatch, SinkError, StorageSink, SysinfoBatch};

use crate::config::InfluxConfig;
use crate::error::InfluxError;
use crate::mirror::FileMirror;
use crate::point::Point;

/// Body of `GET /health`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl HealthReport {
    pub fn is_pass(&self) -> bool {
        self.status.eq_ignore_ascii_case("pass")
    }
}

/// [`StorageSink`] writing line protocol to InfluxDB v2.
pub struct InfluxSink {
    http: reqwest::Client,
    base_url: Url,
    write_url: Url,
    health_url: Url,
    mirror: Option<FileMirror>,
    closed: AtomicBool,
}

impl InfluxSink {
    /// Build a sink with its own HTTP client carrying the token header.
    pub fn new(config: &InfluxConfig) -> Result<Self, InfluxError> {
        let mut token = HeaderValue::from_str(&format!("Token {}", config.token.expose_secret()))
            .map_err(|e| InfluxError::Client(format!("invalid token header: {e}")))?;
        token.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, token);

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("kasa-collector/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|e| InfluxError::Client(format!("failed to build HTTP client: {e}")))?;

        Self::with_client(http, config)
    }

    /// Build a sink around a pre-built client. The client must already
    /// send the `Authorization` header.
    pub fn with_client(http: reqwest::Client, config: &InfluxConfig) -> Result<Self, InfluxError> {
        let mirror = config.write_to_file.then(|| {
            FileMirror::new(config.emeter_output_path(), config.sysinfo_output_path())
        });
        Ok(Self {
            http,
            base_url: config.url.clone(),
            write_url: config.write_url()?,
            health_url: config.health_url()?,
            mirror,
            closed: AtomicBool::new(false),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn mirror(&self) -> Option<&FileMirror> {
        self.mirror.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Query the server health endpoint.
    pub async fn health(&self) -> Result<HealthReport, InfluxError> {
        debug!("GET {}", self.health_url);
        let resp = self.http.get(self.health_url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(InfluxError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }

    /// Write points in one request. Returns the number of lines sent.
    ///
    /// Fails with [`SinkError::Closed`] once the sink is closed.
    pub async fn write_points(&self, points: &[Point]) -> Result<usize, InfluxError> {
        if self.is_closed() {
            return Err(SinkError::Closed.into());
        }
        let lines: Vec<String> = points
            .iter()
            .filter(|p| p.is_writable())
            .map(Point::to_line)
            .collect();
        if lines.is_empty() {
            return Ok(0);
        }

        let resp = self
            .http
            .post(self.write_url.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(lines.join("\n"))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(InfluxError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(lines.len())
    }

    async fn send(&self, measurement: &str, points: &[Point]) {
        match self.write_points(points).await {
            Ok(sent) => debug!(measurement, points = sent, "wrote points to InfluxDB"),
            Err(e) => warn!(
                measurement,
                points = points.len(),
                transient = e.is_transient(),
                error = %e,
                "InfluxDB write failed, dropping batch"
            ),
        }
    }

    fn accepting(&self, measurement: &str) -> bool {
        if self.is_closed() {
            debug!(measurement, "sink closed, discarding batch");
            return false;
        }
        true
    }
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[async_trait]
impl StorageSink for InfluxSink {
    async fn verify(&self) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        let endpoint = self.base_url.to_string();
        match self.health().await {
            Ok(report) if report.is_pass() => {
                info!(
                    url = %self.base_url,
                    version = report.version.as_deref().unwrap_or("unknown"),
                    "InfluxDB is reachable"
                );
                Ok(())
            }
            Ok(report) => Err(SinkError::Unhealthy {
                endpoint,
                status: report.message.unwrap_or(report.status),
            }),
            Err(InfluxError::Status { status, body }) => Err(SinkError::Unhealthy {
                endpoint,
                status: format!("HTTP {status} {body}").trim_end().to_owned(),
            }),
            Err(e) => Err(SinkError::Unreachable {
                endpoint,
                reason: e.to_string(),
            }),
        }
    }

    async fn process_emeter_data(&self, batch: EmeterBatch) {
        if !self.accepting("emeter") {
            return;
        }
        let ts = now_ns();
        let points: Vec<Point> = batch.values().map(|r| Point::from_emeter(r, ts)).collect();
        self.send("emeter", &points).await;

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.append_emeter(&batch).await {
                warn!(error = %e, "failed to mirror emeter batch");
            }
        }
    }

    async fn process_sysinfo_data(&self, batch: SysinfoBatch) {
        if !self.accepting("sysinfo") {
            return;
        }
        let ts = now_ns();
        let points: Vec<Point> = batch.values().map(|r| Point::from_sysinfo(r, ts)).collect();
        self.send("sysinfo", &points).await;

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.append_sysinfo(&batch).await {
                warn!(error = %e, "failed to mirror sysinfo batch");
            }
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(url = %self.base_url, "InfluxDB sink closed");
        }
    }
}

impl std::fmt::Debug for InfluxSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxSink")
            .field("base_url", &self.base_url.as_str())
            .field("mirror", &self.mirror)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
