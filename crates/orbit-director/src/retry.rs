//! Bounded fixed-delay retry.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::DirectorResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `op` until it succeeds or the attempts are used up, returning the
    /// last error. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> DirectorResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DirectorResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            info!(what, attempt, "attempt");
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts => {
                    warn!(what, attempt, error = %err, "attempt failed, retrying");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(what, attempt, error = %err, "giving up");
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DirectorError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(4, Duration::from_secs(1));
        let started = tokio::time::Instant::now();

        let value = policy
            .run("flaky", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(DirectorError::upstream("platform", "busy"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_after_ceiling() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        let err = policy
            .run::<(), _, _>("always", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DirectorError::upstream("scheduler", "down")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DirectorError::Upstream { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
