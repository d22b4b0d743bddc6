use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use retry_policies::policies::ExponentialBackoff;
use retry_policies::{RetryDecision, RetryPolicy};

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    pub fn new(max_retries: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    /// How long to wait before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&self, n_past_retries: u32) -> Option<Duration> {
        let policy = ExponentialBackoff::builder()
            .retry_bounds(self.min_delay, self.max_delay.max(self.min_delay))
            .build_with_max_retries(self.max_retries);

        match policy.should_retry(n_past_retries) {
            RetryDecision::Retry { execute_after } => {
                Some((execute_after - Utc::now()).to_std().unwrap_or_default())
            }
            RetryDecision::DoNotRetry => None,
        }
    }

    /// Runs `op` until it succeeds, fails with an error `is_transient` rejects, or the budget
    /// is spent. Returns the last error together with the number of attempts made.
    pub async fn retry<T, E, F, Fut>(
        &self,
        mut op: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, (E, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut n_past_retries = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !is_transient(&err) {
                return Err((err, n_past_retries + 1));
            }
            let Some(delay) = self.next_delay(n_past_retries) else {
                return Err((err, n_past_retries + 1));
            };
            tracing::debug!(
                "Retry attempt #{}. Sleeping {:?} before the next attempt",
                n_past_retries + 1,
                delay
            );
            tokio::time::sleep(delay).await;
            n_past_retries += 1;
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}
