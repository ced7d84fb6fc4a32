use sl_types::BackendResult;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub const MAX_RETRIES: u32 = 3;
    pub const INITIAL_BACKOFF_MS: u64 = 1000;
    pub const MAX_BACKOFF_MS: u64 = 30000;

    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        std::cmp::min(self.initial_backoff.saturating_mul(factor), self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let attempts = self.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {}ms: {}",
                        what,
                        attempt,
                        attempts,
                        backoff.as_millis(),
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::MAX_RETRIES,
            initial_backoff: Duration::from_millis(Self::INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(Self::MAX_BACKOFF_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_types::BackendError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff(10), Duration::from_millis(30000));
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = RetryPolicy::immediate(3)
            .run("flaky call", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BackendError::Http {
                        status: 503,
                        message: "unavailable".into(),
                    })
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: BackendResult<()> = RetryPolicy::immediate(3)
            .run("down", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Communication {
                    message: "connection refused".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: BackendResult<()> = RetryPolicy::immediate(3)
            .run("bad request", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Http {
                    status: 404,
                    message: "missing".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(BackendError::Http { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
