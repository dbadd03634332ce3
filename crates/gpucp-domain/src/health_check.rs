//! Health-check configuration, per-endpoint attempts, and the
//! aggregate block stored on an instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Pending,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Healthy,
    Partial,
    Unhealthy,
}

impl AggregateStatus {
    /// `healthy` if every checked endpoint is healthy; `partial` if
    /// some are; `unhealthy` if none are. An empty endpoint list
    /// aggregates to `unhealthy` since nothing was confirmed.
    pub fn aggregate(attempts: &[HealthCheckAttempt]) -> Self {
        if attempts.is_empty() {
            return AggregateStatus::Unhealthy;
        }
        let healthy = attempts
            .iter()
            .filter(|a| a.status == EndpointStatus::Healthy)
            .count();
        if healthy == attempts.len() {
            AggregateStatus::Healthy
        } else if healthy > 0 {
            AggregateStatus::Partial
        } else {
            AggregateStatus::Unhealthy
        }
    }
}

/// A single port declared by a template, flattened from the
/// provider's `{type, ports:[...]}` grouping into one entry per port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortDeclaration {
    pub port: u16,
    pub transport: Transport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckAttempt {
    pub port: u16,
    pub url: String,
    pub transport: Transport,
    pub status: EndpointStatus,
    pub last_checked: DateTime<Utc>,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub timeout_per_check_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_wait_time_ms: u64,
    pub target_port: Option<u16>,
}

impl HealthCheckConfig {
    /// Clamp every field to its operational bounds, so a caller
    /// that supplies an out-of-range override gets a usable config
    /// rather than a rejected request. The bounds are resource
    /// guards, not user-facing validation rules.
    pub fn clamped(self) -> Self {
        Self {
            timeout_per_check_ms: self.timeout_per_check_ms.clamp(1_000, 300_000),
            retry_attempts: self.retry_attempts.min(10),
            retry_delay_ms: self.retry_delay_ms.clamp(100, 30_000),
            max_wait_time_ms: self.max_wait_time_ms.clamp(30_000, 1_800_000),
            target_port: self.target_port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckPhase {
    Pending,
    Sweeping,
    Healthy,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckBlock {
    pub phase: HealthCheckPhase,
    pub config: HealthCheckConfig,
    pub attempts: Vec<HealthCheckAttempt>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl HealthCheckBlock {
    pub fn aggregate_status(&self) -> AggregateStatus {
        AggregateStatus::aggregate(&self.attempts)
    }
}
