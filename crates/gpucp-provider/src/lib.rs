//! # gpucp-provider
//!
//! The provider HTTP client: request queue, circuit breaker, retry,
//! and typed operations against the external GPU compute provider.

pub mod circuit_breaker;
pub mod client;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;
pub mod wire;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{resolve_product, ProviderClient, ProviderClientConfig};
pub use rate_limiter::RequestQueue;
