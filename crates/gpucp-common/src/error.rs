//! Error types shared across the control plane.
//!
//! A single closed enum, per the error taxonomy the provider and webhook
//! surfaces agree on. Callers match on kind rather than catching a class
//! hierarchy.

use thiserror::Error;

/// Error kind carried alongside HTTP-relevant metadata (retry-after,
/// upstream status, field errors) so the API layer can render the
/// error envelope without re-deriving it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("name conflict: {0}")]
    NameConflict(String),

    #[error("startup already in progress for this instance")]
    StartupInProgress,

    #[error("startup timed out after {0}ms")]
    StartupTimeout(u64),

    #[error("health check timed out after {0}ms")]
    HealthCheckTimeout(u64),

    #[error("provider request timed out after {0}ms")]
    ProviderTimeout(u64),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimit { retry_after_secs: u64 },

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("resource constraints: {0}")]
    ResourceConstraints(String),

    #[error("provider returned {status}: {code} ({details})")]
    ProviderClient {
        status: u16,
        code: String,
        details: String,
    },

    #[error("network error: {message}")]
    Network { message: String, retryable: bool },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// HTTP status code for the error envelope of the thin API collaborator.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::NameConflict(_) => 409,
            Error::StartupInProgress => 409,
            Error::StartupTimeout(_) | Error::HealthCheckTimeout(_) | Error::ProviderTimeout(_) => {
                408
            }
            Error::RateLimit { .. } => 429,
            Error::CircuitOpen | Error::HealthCheckFailed(_) | Error::ResourceConstraints(_) => {
                503
            }
            Error::ProviderClient { status, .. } => *status,
            Error::Network { .. } => 502,
            Error::Internal(_) | Error::Redis(_) | Error::Json(_) => 500,
        }
    }

    /// Machine-readable code for the error envelope, e.g. `NAME_CONFLICT`.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::NameConflict(_) => "NAME_CONFLICT",
            Error::StartupInProgress => "STARTUP_IN_PROGRESS",
            Error::StartupTimeout(_) => "STARTUP_TIMEOUT",
            Error::HealthCheckTimeout(_) => "HEALTH_CHECK_TIMEOUT",
            Error::ProviderTimeout(_) => "PROVIDER_TIMEOUT",
            Error::RateLimit { .. } => "RATE_LIMITED",
            Error::CircuitOpen => "CIRCUIT_OPEN",
            Error::HealthCheckFailed(_) => "HEALTH_CHECK_FAILED",
            Error::ResourceConstraints(_) => "RESOURCE_CONSTRAINTS",
            Error::ProviderClient { .. } => "PROVIDER_ERROR",
            Error::Network { .. } => "NETWORK_ERROR",
            Error::Internal(_) | Error::Redis(_) | Error::Json(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the same operation might succeed.
    pub fn retryable(&self) -> bool {
        match self {
            Error::Network { retryable, .. } => *retryable,
            Error::ProviderTimeout(_) | Error::RateLimit { .. } | Error::CircuitOpen => true,
            Error::ProviderClient { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
