//! Bounded retry for bootstrap connections.
//!
//! A client usually starts before its server is listening. Connection attempts are
//! repeated a fixed number of times with a backoff in between; only transient
//! errors (refused, timed out, reset) are retried, anything else fails at once.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// How often and how patiently a bootstrap connection is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 11).
    pub max_attempts: u32,
    /// Delay before the second attempt (default: 500ms).
    pub backoff_ms: u64,
    /// Growth factor of the delay; 1.0 keeps it fixed (default).
    pub backoff_multiplier: f64,
    /// Cap on a single delay (default: 10 seconds).
    pub max_backoff_ms: u64,
    /// Timeout of a single connection attempt (default: 5 seconds).
    pub connect_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 11,
            backoff_ms: 500,
            backoff_multiplier: 1.0,
            max_backoff_ms: 10_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Result of [`RetryExecutor::execute`].
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// An attempt succeeded.
    Success(T),
    /// All attempts failed, or one failed with a permanent error.
    Exhausted {
        /// Error of the final attempt.
        last_error: TransportError,
        /// Attempts made, the first included.
        attempts: u32,
    },
}

/// Runs connection attempts under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds, fails permanently or runs out of attempts.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let backoff = self.compute_backoff(attempt - 1);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(last_error) => {
                    return RetryOutcome::Exhausted {
                        last_error,
                        attempts: attempt,
                    }
                }
            }
        }
    }

    /// Like [`execute`](Self::execute), but turns running out of attempts into
    /// [`TransportError::BootstrapFailure`] naming `addr`. Permanent errors are
    /// returned as they are.
    pub async fn bootstrap<F, Fut, T>(&self, addr: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.execute(operation).await {
            RetryOutcome::Success(value) => Ok(value),
            RetryOutcome::Exhausted { last_error, .. } if !last_error.is_transient() => {
                Err(last_error)
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => Err(TransportError::BootstrapFailure {
                addr: addr.to_string(),
                attempts,
                reason: last_error.to_string(),
            }),
        }
    }

    /// Computes `backoff * multiplier^attempt`, capped at `max_backoff_ms`.
    fn compute_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_ms as f64;
        let computed = base * self.config.backoff_multiplier.max(1.0).powi(attempt as i32);
        Duration::from_millis(computed.min(self.config.max_backoff_ms as f64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(RetryConfig {
            max_attempts,
            backoff_ms: 1,
            ..RetryConfig::default()
        })
    }

    fn refused() -> TransportError {
        TransportError::ConnectionRefused {
            addr: "127.0.0.1:7471".to_string(),
        }
    }

    #[test]
    fn test_defaults_match_bootstrap_policy() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 11);
        assert_eq!(config.backoff_ms, 500);
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_server_already_listening() {
        let mut calls = 0;
        let outcome = fast(5)
            .execute(|| {
                calls += 1;
                async { Ok::<_, TransportError>(7471u16) }
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Success(7471)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_server_comes_up_late() {
        let mut calls = 0u32;
        let outcome = fast(5)
            .execute(|| {
                calls += 1;
                let up = calls >= 3;
                async move { if up { Ok("connected") } else { Err(refused()) } }
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Success("connected")));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let mut calls = 0u32;
        let outcome = fast(4)
            .execute(|| {
                calls += 1;
                async { Err::<(), _>(TransportError::ConnectionReset) }
            })
            .await;
        match outcome {
            RetryOutcome::Exhausted {
                last_error: TransportError::ConnectionReset,
                attempts,
            } => assert_eq!(attempts, 4),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn test_protocol_errors_end_retries() {
        let mut calls = 0u32;
        let outcome = fast(5)
            .execute(|| {
                calls += 1;
                async { Err::<(), _>(TransportError::protocol("bad magic")) }
            })
            .await;
        assert!(matches!(
            outcome,
            RetryOutcome::Exhausted {
                last_error: TransportError::ProtocolViolation { .. },
                attempts: 1
            }
        ));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_names_address() {
        let err = fast(3)
            .bootstrap("10.0.0.1:7471", || async {
                Err::<(), _>(TransportError::ConnectionTimeout {
                    addr: "10.0.0.1:7471".to_string(),
                    timeout_ms: 1,
                })
            })
            .await
            .unwrap_err();
        match err {
            TransportError::BootstrapFailure { addr, attempts, .. } => {
                assert_eq!(addr, "10.0.0.1:7471");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_passes_permanent_errors_through() {
        let err = fast(3)
            .bootstrap("peer", || async {
                Err::<(), _>(TransportError::config("capacity mismatch"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationError { .. }));
    }

    #[test]
    fn test_backoff_fixed_and_growing() {
        let fixed = RetryExecutor::default();
        assert_eq!(fixed.compute_backoff(0), Duration::from_millis(500));
        assert_eq!(fixed.compute_backoff(9), Duration::from_millis(500));

        let growing = RetryExecutor::new(RetryConfig {
            backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 500,
            ..RetryConfig::default()
        });
        let delays: Vec<u64> = (0..4)
            .map(|n| growing.compute_backoff(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500]);
    }
}
