use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Bounds for a retried operation: attempt count, exponential delay base,
/// and a cap the computed delay never exceeds (jitter excluded).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based):
    /// `min(base * 2^attempt, cap)` plus random jitter in `[0, base)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped_ms = exp_ms.min(self.max_delay.as_millis() as u64);
        let jitter_ms = if base_ms > 0 {
            rand::thread_rng().gen_range(0..base_ms)
        } else {
            0
        };
        Duration::from_millis(capped_ms + jitter_ms)
    }
}

/// Classifier verdict for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Abort,
}

/// Retry `op` under `policy`, consulting `classify` after each failure and
/// reporting each scheduled retry through `observe` before sleeping.
///
/// The last error is returned unchanged once the classifier aborts or
/// `max_attempts` invocations have failed.
pub async fn retry_classified<T, E, Fut, Op, Classify, Observe>(
    policy: RetryPolicy,
    mut classify: Classify,
    mut observe: Observe,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Classify: FnMut(&E) -> RetryDecision,
    Observe: FnMut(u32, Duration, &E),
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt + 1 >= attempts || classify(&error) == RetryDecision::Abort {
                    return Err(error);
                }
                let delay = policy.delay(attempt);
                observe(attempt, delay, &error);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Retry with the default exhaustive classifier: every failure is retried
/// until the attempt budget runs out.
pub async fn retry<T, E, Fut, Op>(policy: RetryPolicy, op: Op) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_classified(policy, |_| RetryDecision::Retry, |_, _, _| {}, op).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn permanent_failure_invokes_op_exactly_max_attempts_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();
        let result: Result<(), &str> = retry(fast_policy(5), move || {
            let calls = calls_in_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("still broken")
            }
        })
        .await;
        assert_eq!(result.unwrap_err(), "still broken");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn abort_classification_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();
        let result: Result<(), &str> = retry_classified(
            fast_policy(5),
            |_| RetryDecision::Abort,
            |_, _, _| {},
            move || {
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("bad request")
                }
            },
        )
        .await;
        assert_eq!(result.unwrap_err(), "bad request");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();
        let observed = Arc::new(AtomicU32::new(0));
        let observed_in_cb = observed.clone();
        let result: Result<u32, &str> = retry_classified(
            fast_policy(5),
            |_| RetryDecision::Retry,
            move |_, _, _| {
                observed_in_cb.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                let calls = calls_in_op.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("flaky")
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn delay_is_bounded_by_cap_plus_jitter() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1500),
        };
        for attempt in 0..12 {
            let delay = policy.delay(attempt);
            let exp = 100u64.saturating_mul(1 << attempt.min(32));
            assert!(delay >= Duration::from_millis(exp.min(1500)));
            assert!(delay < Duration::from_millis(exp.min(1500) + 100));
            assert!(delay <= policy.max_delay + policy.base_delay);
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy::default();
        assert!(policy.delay(200) <= policy.max_delay + policy.base_delay);
    }
}
