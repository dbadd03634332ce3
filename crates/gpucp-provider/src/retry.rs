//! Retry wrapper around provider calls: exponential backoff capped at
//! 30s with jitter, honoring `Retry-After` on 429, up to N attempts.
//! The retry budget is per-call; the circuit breaker is not consulted
//! between retries of the same call.

use std::future::Future;
use std::time::Duration;

use gpucp_common::backoff::exponential_backoff;

/// What a provider call's error tells the retry loop about itself.
pub trait RetryableOutcome {
    fn http_status(&self) -> Option<u16>;
    fn retry_after(&self) -> Option<Duration>;
}

fn should_retry(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(408) | Some(429) => true,
        Some(s) if s >= 500 => true,
        Some(_) => false,
    }
}

/// Run `call` up to `max_attempts` times, sleeping between attempts
/// according to `Retry-After` (if present) or exponential backoff.
pub async fn with_retry<T, E, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    mut call: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableOutcome,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                let status = err.http_status();
                if attempt >= max_attempts || !should_retry(status) {
                    return Err(err);
                }

                let delay = err
                    .retry_after()
                    .unwrap_or_else(|| exponential_backoff(attempt - 1, base_delay, max_delay));
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct FakeError {
        status: Option<u16>,
        retry_after: Option<Duration>,
    }

    impl RetryableOutcome for FakeError {
        fn http_status(&self) -> Option<u16> {
            self.status
        }
        fn retry_after(&self) -> Option<Duration> {
            self.retry_after
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(3, Duration::from_millis(1), Duration::from_millis(10), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FakeError { status: Some(500), retry_after: None })
                } else {
                    Ok::<_, FakeError>("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_4xx() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(5, Duration::from_millis(1), Duration::from_millis(10), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(FakeError { status: Some(404), retry_after: None }) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn honors_retry_after_on_429() {
        let attempts = AtomicU32::new(0);
        let start = std::time::Instant::now();
        let result = with_retry(2, Duration::from_millis(1), Duration::from_millis(10), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(FakeError {
                        status: Some(429),
                        retry_after: Some(Duration::from_millis(20)),
                    })
                } else {
                    Ok::<_, FakeError>(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
