use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// Bounded retry with exponential backoff. One wrapper serves both the
/// metadata probe and the full fetch; the caller supplies the operation and
/// the predicate that decides whether a given failure is worth retrying.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after `completed` failed attempts: base, then doubling.
    fn delay_after(&self, completed: usize) -> Duration {
        self.base_delay * 2u32.saturating_pow(completed.saturating_sub(1) as u32)
    }

    /// Runs `operation` until it succeeds, the attempt ceiling is reached,
    /// or `should_retry` declines the failure. The last error is returned
    /// unchanged so the caller can classify it.
    pub async fn run<F, Fut, T, E, P>(&self, mut operation: F, mut should_retry: P) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: FnMut(&E) -> bool,
    {
        let mut attempt = 1usize;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= self.max_attempts || !should_retry(&error) {
                        return Err(error);
                    }
                    let delay = self.delay_after(attempt);
                    warn!(
                        attempt,
                        delay_seconds = delay.as_secs(),
                        "attempt failed, backing off: {error}"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
