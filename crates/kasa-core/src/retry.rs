// ── Bounded retry with exponential backoff ──
//
// Every per-device fetch runs through a `RetryPolicy`. The error kind
// only picks the log line; every failure is retried until the attempt
// budget is spent, then the last error goes back to the caller.
// Failures that must not be retried are handled inside the operation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::RetryConfig;
use crate::error::{DeviceError, ErrorKind};

const MIN_BASE_DELAY: Duration = Duration::from_secs(1);

/// Retry strategy composed explicitly at each call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    exponential: bool,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Build a policy, clamping to at least one attempt and a one second
    /// base delay.
    pub fn new(config: &RetryConfig) -> Self {
        if config.max_retries == 0 {
            warn!("fetch max retries must be at least 1, using 1");
        }
        if config.base_delay < MIN_BASE_DELAY {
            warn!(
                configured = ?config.base_delay,
                "retry base delay below 1s, using 1s"
            );
        }
        Self {
            max_retries: config.max_retries.max(1),
            base_delay: config.base_delay.max(MIN_BASE_DELAY),
            exponential: config.exponential,
            max_delay: config.max_delay,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay after failed attempt `attempt` (1-indexed):
    /// `min(base * 2^attempt, max)` when exponential, else `base`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.base_delay.min(self.max_delay);
        }
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// `operation` and `target` only label log lines.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        target: &str,
        mut op: F,
    ) -> Result<T, DeviceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, target, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    log_failure(operation, target, attempt, self.max_retries, &err);
                    if attempt >= self.max_retries {
                        error!(
                            operation,
                            target,
                            attempts = attempt,
                            elapsed_ms = started.elapsed().as_millis(),
                            error = %err,
                            "giving up after {attempt} attempts"
                        );
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    debug!(operation, target, attempt, ?delay, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

fn log_failure(operation: &str, target: &str, attempt: u32, max: u32, err: &DeviceError) {
    let kind = err.kind();
    match kind {
        ErrorKind::Network => warn!(
            operation, target, attempt, max, %kind, error = %err,
            "network error"
        ),
        ErrorKind::Data => warn!(
            operation, target, attempt, max, %kind, error = %err,
            "data error"
        ),
        ErrorKind::Credential | ErrorKind::Unsupported | ErrorKind::Unexpected => error!(
            operation, target, attempt, max, %kind, error = %err,
            "unexpected error"
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_retries,
            base_delay: Duration::from_secs(1),
            exponential: true,
            max_delay: Duration::from_secs(60),
        })
    }

    fn reset() -> DeviceError {
        DeviceError::ConnectionReset {
            host: "10.0.0.5".into(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(32));
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn linear_policy_uses_base_delay() {
        let policy = RetryPolicy::new(&RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            exponential: false,
            max_delay: Duration::from_secs(60),
        });
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
    }

    #[test]
    fn config_is_clamped() {
        let policy = RetryPolicy::new(&RetryConfig {
            max_retries: 0,
            base_delay: Duration::from_millis(10),
            exponential: true,
            max_delay: Duration::from_secs(60),
        });
        assert_eq!(policy.max_retries(), 1);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_attempts_exactly_max_times() {
        let attempts = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let counter = attempts.clone();
        let result: Result<(), _> = policy(3)
            .run("emeter data fetch", "10.0.0.5", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(reset())
                }
            })
            .await;

        assert!(matches!(result, Err(DeviceError::ConnectionReset { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two delays: 2s then 4s.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(6), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(7), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_later_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let value = policy(5)
            .run("sysinfo fetch", "10.0.0.5", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(DeviceError::Other("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn classification_does_not_change_eligibility() {
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<(), _> = policy(2)
            .run("emeter data fetch", "10.0.0.5", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(DeviceError::invalid_data("10.0.0.5", "missing power"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
