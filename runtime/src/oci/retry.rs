//! Retry with Fibonacci backoff for registry network operations.
//!
//! Only idempotent network calls (pushes, mounts, fetches) go through here.
//! Errors that cannot change on a second attempt fail immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use a3s_oci_core::{OciError, Result, RetryPolicy};

/// Run `f` until it succeeds, a non-retryable error occurs, or the policy's
/// attempts are used up.
///
/// Between attempts the task sleeps `initial_delay × fib(n)` (1, 2, 3, 5, …)
/// with the policy's relative jitter. If `cancel` fires while sleeping the
/// wait ends at once and the errors collected so far are returned.
pub async fn retry_on_failure<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(OciError::Cancelled);
    }

    let max_attempts = policy.max_attempts();
    let mut delays = FibonacciBackoff::new(policy.initial_delay(), policy.jitter);
    let mut previous: Vec<String> = Vec::new();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            debug!(operation, error = %err, "Error is not retryable, failing immediately");
            return Err(err);
        }

        warn!(
            operation,
            attempt,
            max_attempts,
            error = %err,
            "Failed retry attempt"
        );

        if attempt >= max_attempts {
            return Err(exhausted(policy, operation, attempt, err, previous));
        }

        let delay = delays.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(operation, attempt, "Cancelled while waiting to retry");
                return Err(exhausted(policy, operation, attempt, err, previous)
                    .context(format!("{} cancelled", operation)));
            }
            _ = tokio::time::sleep(delay) => {}
        }

        previous.push(err.to_string());
    }
}

fn exhausted(
    policy: &RetryPolicy,
    operation: &str,
    attempts: u32,
    last: OciError,
    previous: Vec<String>,
) -> OciError {
    if attempts == 1 {
        return last;
    }
    OciError::RetryExhausted {
        operation: operation.to_string(),
        attempts,
        source: Box::new(last),
        previous: if policy.join_errors { previous } else { Vec::new() },
    }
}

/// Fibonacci delay sequence with symmetric relative jitter.
struct FibonacciBackoff {
    base: Duration,
    jitter: f64,
    current: u32,
    next: u32,
}

impl FibonacciBackoff {
    fn new(base: Duration, jitter: f64) -> Self {
        Self {
            base,
            jitter,
            current: 1,
            next: 2,
        }
    }

    /// Unjittered delay of the next step.
    fn next_base(&mut self) -> Duration {
        let factor = self.current;
        self.current = self.next;
        self.next = self.next.saturating_add(factor);
        self.base.saturating_mul(factor)
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.next_base();
        if self.jitter <= 0.0 {
            return base;
        }
        let scale = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64(scale.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: 1,
            ..RetryPolicy::default()
        }
    }

    fn transient(msg: &str) -> OciError {
        OciError::RegistryError {
            registry: "ghcr.io".to_string(),
            message: msg.to_string(),
        }
    }

    #[test]
    fn test_fibonacci_sequence() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(1), 0.0);
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_base().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 3, 5, 8]);
    }

    #[test]
    fn test_jitter_within_bounds() {
        for _ in 0..100 {
            let mut backoff = FibonacciBackoff::new(Duration::from_millis(1000), 0.2);
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(800), "{:?}", delay);
            assert!(delay <= Duration::from_millis(1200), "{:?}", delay);
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_final_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_on_failure(&fast_policy(), &CancellationToken::new(), "push", || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(transient("flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fails_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> =
            retry_on_failure(&fast_policy(), &CancellationToken::new(), "push", || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(transient(&format!("attempt {}", n)))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            OciError::RetryExhausted {
                attempts, previous, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(previous.len(), 2);
                assert!(previous[0].contains("attempt 1"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_without_joined_errors() {
        let policy = RetryPolicy {
            join_errors: false,
            ..fast_policy()
        };
        let result: Result<()> =
            retry_on_failure(&policy, &CancellationToken::new(), "mount", || async {
                Err(transient("down"))
            })
            .await;
        match result.unwrap_err() {
            OciError::RetryExhausted { previous, .. } => assert!(previous.is_empty()),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> =
            retry_on_failure(&fast_policy(), &CancellationToken::new(), "decode", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(OciError::MalformedContent("bad json".to_string()))
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), OciError::MalformedContent(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_wait() {
        let policy = RetryPolicy {
            initial_delay_ms: 60_000,
            ..RetryPolicy::default()
        };
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let counter = calls.clone();
        let started = std::time::Instant::now();
        let result: Result<()> = retry_on_failure(&policy, &cancel, "push", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient("down"))
            }
        })
        .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("push cancelled"));
        assert!(matches!(err.root(), OciError::RegistryError { .. }));
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> =
            retry_on_failure(&fast_policy(), &cancel, "push", || async { Ok(()) }).await;
        assert!(matches!(result.unwrap_err(), OciError::Cancelled));
    }
}
