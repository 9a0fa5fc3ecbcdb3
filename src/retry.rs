//! Bounded retry with exponential backoff and jitter.
//!
//! The policy is a pure value; the async executor wraps a single network
//! call. Retry decisions are driven entirely by [`FetchError::is_retryable`]
//! so transport code never re-implements classification.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FetchError;

/// Retry policy with exponential backoff.
///
/// The delay before retry *i* (0-indexed) is:
///
/// ```text
/// delay_i = min(base_delay_ms * multiplier^i, max_delay_ms) + jitter
/// ```
///
/// where jitter is uniform in `[0, jitter_ms]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of tries, including the first. Never exceeded.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Upper bound of the additive random jitter.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry `attempt` (0-indexed), without jitter.
    /// `None` once the attempt budget is exhausted.
    pub fn backoff_for(&self, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Like [`backoff_for`](Self::backoff_for) with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        let base = self.backoff_for(attempt)?;
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Some(base + Duration::from_millis(jitter))
    }
}

/// Run `op` under `policy`.
///
/// Retries only retryable errors; a permanent classification aborts
/// immediately without consuming the remaining attempts. Exhausting the
/// budget yields the last classified error; nothing is thrown past this
/// boundary.
pub async fn execute<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => match policy.delay_for(attempt) {
                Some(delay) => {
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 400,
            multiplier: 2.0,
            jitter_ms: 0,
        }
    }

    fn transient() -> FetchError {
        FetchError::Timeout {
            url: "http://device:5333/trio/get/all".to_string(),
        }
    }

    fn permanent() -> FetchError {
        FetchError::HttpStatus {
            status: 404,
            url: "http://device:5333/trio/get/xyz".to_string(),
        }
    }

    #[test]
    fn backoff_sequence_is_non_decreasing_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 500,
            multiplier: 2.0,
            jitter_ms: 0,
        };
        let mut prev = Duration::ZERO;
        for attempt in 0..9 {
            let d = policy.backoff_for(attempt).expect("within budget");
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            assert!(d <= Duration::from_millis(500), "attempt {attempt}: {d:?}");
            prev = d;
        }
    }

    #[test]
    fn backoff_exhausted_past_budget() {
        let policy = no_jitter(3);
        assert!(policy.backoff_for(0).is_some());
        assert!(policy.backoff_for(1).is_some());
        assert!(policy.backoff_for(2).is_none());
        assert!(policy.backoff_for(100).is_none());
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 1.0,
            jitter_ms: 50,
        };
        for _ in 0..100 {
            let d = policy.delay_for(0).unwrap();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_never_exceed_maximum() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let policy = no_jitter(3);

        let result: Result<(), _> = execute(&policy, || {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_aborts_without_consuming_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let policy = no_jitter(5);

        let result: Result<(), _> = execute(&policy, || {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(permanent())
            }
        })
        .await;

        assert_eq!(result, Err(permanent()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let policy = no_jitter(4);

        let result = execute(&policy, || {
            let calls = Arc::clone(&calls_in);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_yields_last_classified_error() {
        let policy = no_jitter(2);
        let result: Result<(), _> = execute(&policy, || async { Err(transient()) }).await;
        assert_eq!(result, Err(transient()));
    }

    #[test]
    fn policy_serde_roundtrip() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            multiplier: 1.5,
            jitter_ms: 100,
        };
        let json = serde_json::to_string(&policy).expect("serialize");
        let back: RetryPolicy = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.max_attempts, policy.max_attempts);
        assert_eq!(back.base_delay_ms, policy.base_delay_ms);
        assert!((back.multiplier - policy.multiplier).abs() < f64::EPSILON);
    }
}
