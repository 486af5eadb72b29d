//! Fixed-attempt, fixed-backoff retry for remote calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use nodeflow_types::config::PollingConfig;

use super::remote::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Duration,
}

impl RetryPolicy {
    /// `attempts` counts the first call; zero is treated as one.
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(config: &PollingConfig) -> Self {
        Self::new(config.retry_attempts, config.retry_backoff())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether another attempt follows a transient failure on `attempt`
    /// (1-based).
    pub fn should_retry(&self, attempt: u32, error: &RemoteError) -> bool {
        error.is_transient() && attempt < self.attempts
    }

    /// Run `op`, retrying transient errors. Any other error, or the last
    /// transient one, is returned as-is.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt, &e) => {
                    warn!(operation, attempt, error = %e, "remote call failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_with_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let calls = &AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = policy
            .run("status", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(RemoteError::Transient("503".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_return_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(100));
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("sync", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Transient("timeout".into()))
            })
            .await;
        assert_eq!(result, Err(RemoteError::Transient("timeout".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_secs(60));
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("status", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::NotFound("app".into()))
            })
            .await;
        assert!(matches!(result, Err(RemoteError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts(), 1);
        let config = PollingConfig::default();
        assert_eq!(RetryPolicy::from_config(&config).attempts(), 3);
    }
}
