//! Configuration management for the GPU instance control plane.
//!
//! Everything is loaded from environment variables (optionally via a
//! `.env` file) and validated at startup: fail fast rather than
//! discover a bad value mid-run.

use anyhow::{bail, Context, Result};
use std::env;
use std::time::Duration;

/// Top-level configuration, assembled once at startup and passed by
/// reference into the composition root.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: BindConfig,
    pub api: ApiConfig,
    pub provider: ProviderConfig,
    pub webhook: WebhookConfig,
    pub defaults: DefaultsConfig,
    pub auto_stop: AutoStopConfig,
    pub migration: MigrationConfig,
    pub health_check: HealthCheckDefaults,
    pub cache: CacheConfig,
    pub jobs: JobConfig,
    pub redis: RedisConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone)]
pub struct BindConfig {
    pub host: String,
    pub port: u16,
}

/// Bind/auth settings for the thin HTTP surface. Kept distinct from
/// [`BindConfig`] (the daemon's own health/ready port) since the two
/// binaries run as separate processes and must not collide on the
/// same host by default.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
    pub credential: String,
}

/// Provider HTTP client policy: base URL, auth, timeouts, retry,
/// circuit breaker, rate limit.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_credential: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: u32,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub secret: String,
}

/// Defaults applied to fields omitted on instance creation.
#[derive(Debug, Clone)]
pub struct DefaultsConfig {
    pub region: String,
    pub gpu_count: u32,
    pub rootfs_gb: u32,
    pub region_fallback: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AutoStopConfig {
    pub enabled: bool,
    pub interval_minutes: u32,
    pub inactivity_threshold_minutes: u32,
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub enabled: bool,
    pub interval_minutes: u32,
    pub job_timeout: Duration,
    pub max_concurrent: u32,
    pub dry_run: bool,
    pub retry_failed: bool,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct HealthCheckDefaults {
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_wait_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub products_ttl: Duration,
    pub templates_ttl: Duration,
    pub instances_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub concurrency: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub processing_stale_timeout: Duration,
    pub shutdown_grace_period: Duration,
    pub startup_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub rust_log: String,
    pub metrics_port: u16,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_or(key, default_secs))
}

impl Config {
    /// Load and validate configuration from the environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            bind: Self::load_bind()?,
            api: Self::load_api()?,
            provider: Self::load_provider()?,
            webhook: Self::load_webhook()?,
            defaults: Self::load_defaults()?,
            auto_stop: Self::load_auto_stop()?,
            migration: Self::load_migration()?,
            health_check: Self::load_health_check()?,
            cache: Self::load_cache()?,
            jobs: Self::load_jobs()?,
            redis: Self::load_redis()?,
            observability: Self::load_observability()?,
        };

        config.validate()?;
        Ok(config)
    }

    fn load_bind() -> Result<BindConfig> {
        Ok(BindConfig {
            host: env::var("BIND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("BIND_PORT", 8080u16),
        })
    }

    fn load_api() -> Result<ApiConfig> {
        Ok(ApiConfig {
            host: env::var("API_BIND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("API_BIND_PORT", 8081u16),
            metrics_port: env_or("API_METRICS_PORT", 9091u16),
            credential: env::var("API_CREDENTIAL").context("API_CREDENTIAL must be set")?,
        })
    }

    fn load_provider() -> Result<ProviderConfig> {
        Ok(ProviderConfig {
            base_url: env::var("PROVIDER_BASE_URL")
                .unwrap_or_else(|_| "https://api.provider.example/v1".to_string()),
            api_credential: env::var("PROVIDER_API_CREDENTIAL")
                .context("PROVIDER_API_CREDENTIAL must be set")?,
            request_timeout: env_duration_secs("PROVIDER_REQUEST_TIMEOUT_SECS", 30),
            max_retries: env_or("PROVIDER_MAX_RETRIES", 3u32),
            retry_base_delay: Duration::from_millis(env_or(
                "PROVIDER_RETRY_BASE_DELAY_MS",
                1000u64,
            )),
            circuit_breaker_threshold: env_or("CIRCUIT_BREAKER_THRESHOLD", 5u32),
            circuit_breaker_timeout: env_duration_secs("CIRCUIT_BREAKER_TIMEOUT_SECS", 60),
            rate_limit_window: env_duration_secs("RATE_LIMIT_WINDOW_SECS", 1),
            rate_limit_max_requests: env_or("RATE_LIMIT_MAX_REQUESTS", 10u32),
        })
    }

    fn load_webhook() -> Result<WebhookConfig> {
        Ok(WebhookConfig {
            timeout: env_duration_secs("WEBHOOK_TIMEOUT_SECS", 10),
            max_retries: env_or("WEBHOOK_MAX_RETRIES", 5u32),
            secret: env::var("WEBHOOK_SECRET").context("WEBHOOK_SECRET must be set")?,
        })
    }

    fn load_defaults() -> Result<DefaultsConfig> {
        let region_fallback = env::var("REGION_FALLBACK_LIST")
            .ok()
            .map(|s| s.split(',').map(|r| r.trim().to_string()).collect())
            .unwrap_or_default();

        Ok(DefaultsConfig {
            region: env::var("DEFAULT_REGION").unwrap_or_else(|_| "us-east".to_string()),
            gpu_count: env_or("DEFAULT_GPU_COUNT", 1u32),
            rootfs_gb: env_or("DEFAULT_ROOTFS_GB", 60u32),
            region_fallback,
        })
    }

    fn load_auto_stop() -> Result<AutoStopConfig> {
        Ok(AutoStopConfig {
            enabled: env_or("AUTO_STOP_ENABLED", true),
            interval_minutes: env_or("AUTO_STOP_INTERVAL_MINUTES", 5u32),
            inactivity_threshold_minutes: env_or("AUTO_STOP_INACTIVITY_THRESHOLD_MINUTES", 20u32),
        })
    }

    fn load_migration() -> Result<MigrationConfig> {
        Ok(MigrationConfig {
            enabled: env_or("MIGRATION_ENABLED", true),
            interval_minutes: env_or("MIGRATION_INTERVAL_MINUTES", 15u32),
            job_timeout: Duration::from_millis(env_or("MIGRATION_JOB_TIMEOUT_MS", 60_000u64)),
            max_concurrent: env_or("MIGRATION_MAX_CONCURRENT", 5u32),
            dry_run: env_or("MIGRATION_DRY_RUN", false),
            retry_failed: env_or("MIGRATION_RETRY_FAILED", true),
            log_level: env::var("MIGRATION_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    fn load_health_check() -> Result<HealthCheckDefaults> {
        Ok(HealthCheckDefaults {
            timeout_ms: env_or("HEALTH_CHECK_TIMEOUT_MS", 5_000u64),
            retry_attempts: env_or("HEALTH_CHECK_RETRY_ATTEMPTS", 3u32),
            retry_delay_ms: env_or("HEALTH_CHECK_RETRY_DELAY_MS", 2_000u64),
            max_wait_time_ms: env_or("HEALTH_CHECK_MAX_WAIT_TIME_MS", 300_000u64),
        })
    }

    fn load_cache() -> Result<CacheConfig> {
        Ok(CacheConfig {
            products_ttl: env_duration_secs("CACHE_PRODUCTS_TTL_SECS", 300),
            templates_ttl: env_duration_secs("CACHE_TEMPLATES_TTL_SECS", 300),
            instances_ttl: env_duration_secs("CACHE_INSTANCES_TTL_SECS", 10),
        })
    }

    fn load_jobs() -> Result<JobConfig> {
        Ok(JobConfig {
            concurrency: env_or("JOB_CONCURRENCY", 5u32),
            max_attempts: env_or("JOB_MAX_ATTEMPTS", 5u32),
            backoff_base: Duration::from_millis(env_or("JOB_BACKOFF_BASE_MS", 1_000u64)),
            backoff_max: Duration::from_secs(env_or("JOB_BACKOFF_MAX_SECS", 30u64)),
            processing_stale_timeout: env_duration_secs("JOB_PROCESSING_STALE_TIMEOUT_SECS", 300),
            shutdown_grace_period: env_duration_secs("SHUTDOWN_GRACE_PERIOD_SECS", 5),
            startup_timeout: env_duration_secs("STARTUP_TIMEOUT_SECS", 600),
        })
    }

    fn load_redis() -> Result<RedisConfig> {
        Ok(RedisConfig {
            url: env::var("REDIS_URL").context("REDIS_URL must be set")?,
            key_prefix: env::var("REDIS_KEY_PREFIX").unwrap_or_else(|_| "gpucp".to_string()),
        })
    }

    fn load_observability() -> Result<ObservabilityConfig> {
        Ok(ObservabilityConfig {
            rust_log: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: env_or("METRICS_PORT", 9090u16),
        })
    }

    /// Enforce the documented operational bounds, so a
    /// misconfigured deployment fails at startup rather than silently
    /// clamping at the call site.
    fn validate(&self) -> Result<()> {
        if self.webhook.secret.len() < 16 {
            bail!("WEBHOOK_SECRET must be at least 16 characters");
        }
        if self.api.credential.len() < 8 {
            bail!("API_CREDENTIAL must be at least 8 characters");
        }
        if !(1..=60).contains(&self.auto_stop.interval_minutes) {
            bail!("AUTO_STOP_INTERVAL_MINUTES must be within 1..=60");
        }
        if !(1..=60).contains(&self.migration.interval_minutes) {
            bail!("MIGRATION_INTERVAL_MINUTES must be within 1..=60");
        }
        if !(1..=20).contains(&self.migration.max_concurrent) {
            bail!("MIGRATION_MAX_CONCURRENT must be within 1..=20");
        }
        if !(1..=50).contains(&self.jobs.concurrency) {
            bail!("JOB_CONCURRENCY must be within 1..=50");
        }
        if !(1_000..=300_000).contains(&self.health_check.timeout_ms) {
            bail!("HEALTH_CHECK_TIMEOUT_MS must be within 1000..=300000");
        }
        if self.health_check.retry_attempts > 10 {
            bail!("HEALTH_CHECK_RETRY_ATTEMPTS must be within 0..=10");
        }
        if !(100..=30_000).contains(&self.health_check.retry_delay_ms) {
            bail!("HEALTH_CHECK_RETRY_DELAY_MS must be within 100..=30000");
        }
        if !(30_000..=1_800_000).contains(&self.health_check.max_wait_time_ms) {
            bail!("HEALTH_CHECK_MAX_WAIT_TIME_MS must be within 30000..=1800000");
        }
        if !(Duration::from_secs(30)..=Duration::from_secs(1800))
            .contains(&self.jobs.startup_timeout)
        {
            bail!("STARTUP_TIMEOUT_SECS must be within 30..=1800 seconds");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_env(key: &str, value: &str) {
        // SAFETY: this test runs single-threaded over the process
        // environment (see below); no other thread reads env vars
        // while it mutates them.
        unsafe { env::set_var(key, value) };
    }

    fn set_required_env() {
        set_env("PROVIDER_API_CREDENTIAL", "test-credential");
        set_env("WEBHOOK_SECRET", "a-sufficiently-long-secret");
        set_env("API_CREDENTIAL", "a-test-api-credential");
        set_env("REDIS_URL", "redis://localhost:6379");
    }

    // One test body for every env-dependent scenario: the process
    // environment is global, so scenarios must run sequentially.
    #[test]
    fn load_validates_the_environment() {
        set_required_env();
        let config = Config::load().expect("config should load with defaults");
        assert_eq!(config.bind.port, 8080);
        assert_eq!(config.auto_stop.interval_minutes, 5);
        assert_eq!(config.jobs.concurrency, 5);

        set_env("WEBHOOK_SECRET", "short");
        let result = Config::load();
        assert!(result.unwrap_err().to_string().contains("WEBHOOK_SECRET"));
        set_env("WEBHOOK_SECRET", "a-sufficiently-long-secret");

        set_env("MIGRATION_MAX_CONCURRENT", "100");
        assert!(Config::load().is_err());
        unsafe { env::remove_var("MIGRATION_MAX_CONCURRENT") };

        assert!(Config::load().is_ok());
    }
}
