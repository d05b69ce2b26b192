use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retry_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(retry_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            retry_delay,
            max_delay,
            max_retries,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts allowed for one call, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.retry_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.saturating_sub(1).min(32);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }

    /// Returns how long to wait before another attempt, or `None` when the
    /// error is not retryable or `attempt` used up the budget.
    pub fn next_delay(&self, attempt: u32, error: &StoreError) -> Option<Duration> {
        if !error.is_retryable() || attempt >= self.max_attempts() {
            return None;
        }
        let computed = self.delay(attempt);
        match error {
            StoreError::RateLimited {
                retry_after: Some(hint),
            } => Some(computed.max(*hint)),
            _ => Some(computed),
        }
    }
}

/// Attempts and accumulated backoff for one operation or listing call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub waited: Duration,
}

impl RetryState {
    pub async fn backoff(&mut self, delay: Duration) {
        self.waited += delay;
        tokio::time::sleep(delay).await;
    }
}

/// Runs `call` until it succeeds, fails permanently or the policy gives up.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    state: &mut RetryState,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    loop {
        state.attempts += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => match policy.next_delay(state.attempts, &err) {
                Some(delay) => {
                    tracing::debug!(attempt = state.attempts, ?delay, error = %err, "retrying store call");
                    state.backoff(delay).await;
                }
                None => return Err(err),
            },
        }
    }
}
