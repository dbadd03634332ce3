//! # gpucp-common
//!
//! Shared infrastructure used by every crate in the GPU instance control
//! plane: the closed error taxonomy, structured logging setup, HMAC
//! signing for webhooks, correlation IDs, backoff math, and a thin
//! Redis client for health checks.

pub mod auth;
pub mod backoff;
pub mod error;
pub mod logging;
pub mod redis_client;

pub use auth::{sign_hmac, verify_hmac, CorrelationId};
pub use backoff::{exponential_backoff, is_retryable_status};
pub use error::{Error, Result};
pub use logging::{init_tracing, init_tracing_json};
pub use redis_client::RedisClient;
