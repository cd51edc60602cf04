//! Bounded polling for readiness probes.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PtmError, PtmResult};

/// Fixed retry budget with a fixed sleep interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of probe attempts.
    pub attempts: u32,
    /// Sleep between attempts, in milliseconds.
    pub interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(attempts: u32, interval_ms: u64) -> Self {
        Self {
            attempts,
            interval_ms,
        }
    }

    /// Sleep interval as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Poll `probe` until it returns `Ok(true)`.
    ///
    /// Probe errors count as a failed attempt; the last one is logged.
    /// After `attempts` failures this returns [`PtmError::Timeout`] naming
    /// the host and the operation.
    pub async fn poll<F, Fut>(&self, host: &str, operation: &str, mut probe: F) -> PtmResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PtmResult<bool>>,
    {
        for attempt in 1..=self.attempts {
            match probe().await {
                Ok(true) => {
                    tracing::debug!(host, operation, attempt, "Probe succeeded");
                    return Ok(());
                }
                Ok(false) => {
                    tracing::trace!(host, operation, attempt, "Probe not ready");
                }
                Err(e) => {
                    tracing::debug!(host, operation, attempt, error = %e, "Probe failed");
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.interval()).await;
            }
        }

        Err(PtmError::Timeout {
            host: host.to_string(),
            operation: operation.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, 100);

        policy
            .poll("zoo1", "zookeeper start", || async {
                Ok(calls.fetch_add(1, Ordering::SeqCst) >= 2)
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_host_and_operation() {
        let policy = RetryPolicy::new(3, 100);
        let err = policy
            .poll("cass1", "cassandra start", || async {
                Err(PtmError::Socket {
                    address: "10.0.0.5:9042".into(),
                    message: "refused".into(),
                })
            })
            .await
            .unwrap_err();

        match err {
            PtmError::Timeout { host, operation } => {
                assert_eq!(host, "cass1");
                assert_eq!(operation, "cassandra start");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
