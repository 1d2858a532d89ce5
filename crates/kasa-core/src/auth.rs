// ── Layered device authentication ──
//
// A discovered device is validated in up to three steps:
//
//   1. TryDiscoveredHandle  refresh the handle discovery returned
//   2. RetryWithCredentials fresh connections with the configured account
//   3. FallbackNoAuth       one unauthenticated connection
//
// Each step is bounded by the auth timeout. A Smart-family handle that
// fails step 1, or any protocol-unsupported failure, is rejected
// without further connection attempts.

use std::future::Future;
use std::sync::Arc;

use strum::Display;
use tracing::{debug, warn};

use crate::config::{AuthConfig, Credentials};
use crate::device::{DeviceFamily, DeviceProtocol, DeviceRef};
use crate::error::{DeviceError, ErrorKind};

/// Which step produced the validated handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum AuthPath {
    DiscoveredHandle,
    Credentials,
    Unauthenticated,
}

/// Classification attached to a terminal authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureHint {
    Unreachable,
    RequiresCloudCredentials,
    Generic,
}

/// Terminal state of one authentication run.
#[derive(Debug)]
pub enum AuthOutcome {
    Authenticated { handle: DeviceRef, path: AuthPath },
    Rejected { reason: String },
    Failed { error: DeviceError, hint: FailureHint },
}

/// Runs the authentication state machine against the device protocol.
pub struct Authenticator {
    protocol: Arc<dyn DeviceProtocol>,
    credentials: Option<Credentials>,
    config: AuthConfig,
}

impl Authenticator {
    pub fn new(
        protocol: Arc<dyn DeviceProtocol>,
        credentials: Option<Credentials>,
        config: AuthConfig,
    ) -> Self {
        Self {
            protocol,
            credentials,
            config,
        }
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Validate a discovered candidate.
    pub async fn authenticate(&self, ip: &str, candidate: DeviceRef) -> AuthOutcome {
        // ── Step 1: discovered handle ──
        let family = candidate.family();
        let direct = self
            .bounded(ip, "device validation", async {
                candidate.update().await?;
                Ok(Arc::clone(&candidate))
            })
            .await;
        match direct {
            Ok(handle) => {
                return AuthOutcome::Authenticated {
                    handle,
                    path: AuthPath::DiscoveredHandle,
                };
            }
            Err(e) if e.kind() == ErrorKind::Unsupported || family == DeviceFamily::Smart => {
                warn!(ip, %family, error = %e, "device requires a newer protocol, skipping");
                return AuthOutcome::Rejected {
                    reason: e.to_string(),
                };
            }
            Err(e) => {
                debug!(ip, %family, error = %e, "discovered handle did not validate");
            }
        }

        // ── Step 2: fresh connections with credentials ──
        let creds = self.credentials.as_ref();
        let mut credential_refused = false;
        for attempt in 1..=self.config.max_retries.max(1) {
            match self.open(ip, creds).await {
                Ok(handle) => {
                    return AuthOutcome::Authenticated {
                        handle,
                        path: AuthPath::Credentials,
                    };
                }
                Err(e) if e.kind() == ErrorKind::Unsupported => {
                    warn!(ip, error = %e, "device protocol unsupported, skipping");
                    return AuthOutcome::Rejected {
                        reason: e.to_string(),
                    };
                }
                Err(e) if e.is_credential() => {
                    warn!(ip, attempt, error = %e, "credentials refused, trying without authentication");
                    credential_refused = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        ip,
                        attempt,
                        max = self.config.max_retries,
                        kind = %e.kind(),
                        error = %e,
                        "authenticated connection failed"
                    );
                }
            }
        }

        // ── Step 3: unauthenticated fallback ──
        match self.open(ip, None).await {
            Ok(handle) => AuthOutcome::Authenticated {
                handle,
                path: AuthPath::Unauthenticated,
            },
            Err(error) => {
                let hint = classify_failure(&error, credential_refused);
                AuthOutcome::Failed { error, hint }
            }
        }
    }

    /// Connect to a manually configured host: unicast discovery, then a
    /// credentialed connection, then an unauthenticated one.
    pub async fn connect_manual(&self, ip: &str) -> Result<DeviceRef, DeviceError> {
        let creds = self.credentials.as_ref();

        let discovered = self
            .bounded(ip, "unicast discovery", async {
                let handle = self.protocol.discover_single(ip, creds).await?;
                handle.update().await?;
                Ok(handle)
            })
            .await;
        match discovered {
            Ok(handle) => return Ok(handle),
            Err(e) if e.kind() == ErrorKind::Unsupported => return Err(e),
            Err(e) => debug!(ip, error = %e, "unicast discovery failed, connecting directly"),
        }

        match self.open(ip, creds).await {
            Ok(handle) => Ok(handle),
            Err(e) if creds.is_none() || e.kind() == ErrorKind::Unsupported => Err(e),
            Err(e) => {
                debug!(ip, error = %e, "authenticated connection failed, trying without credentials");
                self.open(ip, None).await
            }
        }
    }

    /// Connect and refresh within the auth timeout. A handle that fails
    /// its first refresh is disconnected before the error is returned.
    async fn open(
        &self,
        ip: &str,
        credentials: Option<&Credentials>,
    ) -> Result<DeviceRef, DeviceError> {
        self.bounded(ip, "connect", async {
            let handle = self.protocol.connect(ip, credentials).await?;
            if let Err(e) = handle.update().await {
                if let Err(close) = handle.disconnect().await {
                    debug!(ip, error = %close, "disconnect after failed refresh");
                }
                return Err(e);
            }
            Ok(handle)
        })
        .await
    }

    async fn bounded<F>(&self, ip: &str, operation: &str, fut: F) -> Result<DeviceRef, DeviceError>
    where
        F: Future<Output = Result<DeviceRef, DeviceError>>,
    {
        tokio::time::timeout(self.config.timeout, fut)
            .await
            .unwrap_or_else(|_| Err(DeviceError::timeout(ip, operation, self.config.timeout)))
    }
}

fn classify_failure(error: &DeviceError, credential_refused: bool) -> FailureHint {
    if credential_refused || error.is_credential() {
        return FailureHint::RequiresCloudCredentials;
    }
    match error.kind() {
        ErrorKind::Network => FailureHint::Unreachable,
        _ => FailureHint::Generic,
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("has_credentials", &self.credentials.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
