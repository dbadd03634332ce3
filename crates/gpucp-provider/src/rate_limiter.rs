//! Single shared FIFO-wait rate limiter for outbound provider calls.
//!
//! Adapted from the keyed, per-caller token bucket pattern (one
//! `governor::RateLimiter` per API key) to a single process-wide
//! limiter: the provider imposes one shared limit, so every call
//! serializes through one request queue.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter as GovernorLimiter};
use tokio_util::sync::CancellationToken;

type Limiter = GovernorLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Wraps a non-keyed `governor` limiter so callers queue in FIFO
/// order; a cancellation token aborts the wait without ever letting
/// the request through.
pub struct RequestQueue {
    limiter: Arc<Limiter>,
}

impl RequestQueue {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        let per_window = NonZeroU32::new(max_requests.max(1)).expect("max_requests > 0");
        let quota = Quota::with_period(window / per_window.get())
            .expect("window/max_requests must be non-zero")
            .allow_burst(per_window);

        Self {
            limiter: Arc::new(GovernorLimiter::direct(quota)),
        }
    }

    /// Wait until the next slot is available, or return `None` if
    /// `cancel` fires first; the caller must not issue the request
    /// in that case.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<()> {
        tokio::select! {
            _ = self.limiter.until_ready() => Some(()),
            _ = cancel.cancelled() => None,
        }
    }
}
