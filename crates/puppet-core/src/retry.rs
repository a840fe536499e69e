use std::{future::Future, time::Duration};

use tracing::warn;

use crate::error::PuppetError;

/// Exponential backoff for retrying transport failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(500, 30_000, 5)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy runs out of attempts.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, PuppetError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PuppetError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt, err.retry_after_ms);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transport failure"
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{error::PuppetErrorKind, types::EntityKind};

    #[test]
    fn starts_with_base_delay() {
        let policy = RetryPolicy::new(250, 8_000, 3);
        assert_eq!(
            policy.delay_for_attempt(0, None),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn scales_exponentially_and_caps_at_max() {
        let policy = RetryPolicy::new(100, 1_000, 3);
        assert_eq!(
            policy.delay_for_attempt(3, None),
            Duration::from_millis(800)
        );
        assert_eq!(
            policy.delay_for_attempt(5, None),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn honors_retry_after_hint_when_larger() {
        let policy = RetryPolicy::new(500, 20_000, 3);
        assert_eq!(
            policy.delay_for_attempt(1, Some(10_000)),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn always_allows_one_attempt() {
        assert_eq!(RetryPolicy::new(1, 1, 0).max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transport_failures_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let value = retry_with_backoff(RetryPolicy::new(10, 100, 5), || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(PuppetError::backend("connection reset"))
            } else {
                Ok("up")
            }
        })
        .await
        .expect("third attempt should succeed");

        assert_eq!(value, "up");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_with_backoff(RetryPolicy::new(10, 100, 3), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(PuppetError::backend("still down"))
        })
        .await
        .expect_err("should give up");

        assert_eq!(err.kind, PuppetErrorKind::BackendFailure);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_recoverable_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_with_backoff(RetryPolicy::default(), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(PuppetError::not_found(EntityKind::Message, "m404"))
        })
        .await
        .expect_err("not found is final");

        assert_eq!(err.kind, PuppetErrorKind::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
