//! Exponential backoff with jitter, shared by the provider client, the
//! webhook dispatcher, and the durable job queue's retry scheduling.

use rand::Rng;
use std::time::Duration;

/// Compute `min(base * 2^attempt, max)` with +/-20% jitter.
///
/// `attempt` is zero-based: the delay before the first retry uses
/// `attempt = 0`.
pub fn exponential_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = 2u64.saturating_pow(attempt.min(32));
    let scaled = base.as_millis() as u64 * exp;
    let capped = scaled.min(max.as_millis() as u64);

    let jitter_factor = rand::thread_rng().gen_range(0.8..1.2);
    let jittered = (capped as f64 * jitter_factor) as u64;

    Duration::from_millis(jittered)
}

/// Classify whether an HTTP status (or the absence of one, for network
/// failures) should be retried at the provider-client layer: network
/// errors, timeouts, 5xx, and 429 are retryable; all other 4xx are not.
pub fn is_retryable_status(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(s) if (200..300).contains(&s) => false,
        Some(408) | Some(429) => true,
        Some(s) if s >= 500 => true,
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_max() {
        let max = Duration::from_secs(30);
        for attempt in 0..10 {
            let delay = exponential_backoff(attempt, Duration::from_secs(1), max);
            assert!(delay <= Duration::from_millis((max.as_millis() as f64 * 1.21) as u64));
        }
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(300);
        let first = exponential_backoff(0, base, max).as_millis();
        let third = exponential_backoff(3, base, max).as_millis();
        assert!(third > first);
    }

    #[test]
    fn retryable_classification_matches_policy() {
        assert!(is_retryable_status(None));
        assert!(is_retryable_status(Some(429)));
        assert!(is_retryable_status(Some(408)));
        assert!(is_retryable_status(Some(503)));
        assert!(!is_retryable_status(Some(200)));
        assert!(!is_retryable_status(Some(400)));
        assert!(!is_retryable_status(Some(404)));
    }
}
