//! Capped exponential backoff for transient upstream faults.
//!
//! The same policy guards every collaborator call site (driver index, ETA
//! oracle): base 200 ms, factor 2, up to 3 retries. Only
//! [`EngineError::Unavailable`] is retried; everything else propagates on
//! the first attempt.

use std::future::Future;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            factor: 2,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * factor^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(self.factor.saturating_pow(attempt))
    }
}

/// Run `op`, retrying transient failures per `policy`. The final transient
/// error propagates once retries are exhausted.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                tracing::debug!(attempt, error = %err, "transient fault, backing off");
                tokio::time::sleep(policy.delay(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(200));
        assert_eq!(policy.delay(1), Duration::from_millis(400));
        assert_eq!(policy.delay(2), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(RetryPolicy::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::Unavailable("index flapping".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.expect("third attempt succeeds"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<()> = with_backoff(RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Unavailable("oracle down".into())) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::Unavailable(_))));
        // 1 initial + 3 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<()> = with_backoff(RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::bad_input("radius too large")) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::BadInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
