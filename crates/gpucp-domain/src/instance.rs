//! The instance record: the state store's unit of truth.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::health_check::HealthCheckBlock;

/// A template ID as the provider sends it: string or integer on the
/// wire, canonicalized to a string internally. The provider emits both
/// shapes, so a faithful client accepts both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateId(pub String);

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TemplateId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl<'de> Deserialize<'de> for TemplateId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Str(String),
            Int(i64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Str(s) => Ok(TemplateId(s)),
            Repr::Int(i) => Ok(TemplateId(i.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Created,
    Starting,
    Running,
    HealthChecking,
    Ready,
    Stopping,
    Stopped,
    Terminated,
    Failed,
    /// provider-side spot reclaim.
    Exited,
    /// control-plane initiated migration in flight.
    Migrating,
}

impl InstanceStatus {
    /// Terminal states don't accept further worker-driven transitions
    /// without an explicit user action (restart, migrate).
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Terminated | InstanceStatus::Failed)
    }

    pub fn is_live(self) -> bool {
        !matches!(self, InstanceStatus::Terminated)
    }
}

/// Immutable-after-create configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub gpu_count: u32,
    pub rootfs_gb: u32,
    pub region: String,
    pub image_url: String,
    pub image_auth_credential_id: Option<String>,
    pub ports: Vec<crate::health_check::PortDeclaration>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTimestamps {
    pub created: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub ready: Option<DateTime<Utc>>,
    pub failed: Option<DateTime<Utc>>,
    pub stopping: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    pub terminated: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub provider_id: Option<String>,
    pub status: InstanceStatus,
    pub product_id: String,
    pub template_id: TemplateId,
    pub config: InstanceConfig,
    pub timestamps: InstanceTimestamps,
    pub webhook_url: Option<String>,
    pub last_error: Option<String>,
    pub health_check: Option<HealthCheckBlock>,
    /// Set by the migration scheduler when this instance's provider-ID
    /// was last replaced due to a spot reclaim; used to classify
    /// migration eligibility for provider-reported spot fields.
    pub spot_reclaim_time: Option<String>,
    pub spot_status: Option<String>,
}

impl Instance {
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        let since = self
            .timestamps
            .last_used
            .or(self.timestamps.started)
            .unwrap_or(now);
        now - since
    }
}

/// `[A-Za-z0-9_-]{1,100}`, checked by hand rather than pulling in a
/// regex crate for one pattern.
fn validate_instance_name(name: &str) -> Result<(), validator::ValidationError> {
    let valid = !name.is_empty()
        && name.len() <= 100
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');

    if valid {
        Ok(())
    } else {
        Err(validator::ValidationError::new("invalid_instance_name"))
    }
}

#[derive(Debug, Validate, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    #[validate(custom(function = "validate_instance_name"))]
    pub name: String,

    pub product_name: String,

    pub template_id: TemplateId,

    pub region: Option<String>,

    #[validate(range(min = 1, max = 8))]
    pub gpu_count: Option<u32>,

    #[validate(range(min = 20, max = 1000))]
    pub rootfs_gb: Option<u32>,

    pub image_url: Option<String>,
    pub image_auth_credential_id: Option<String>,
    pub ports: Option<Vec<u16>>,
    pub env: Option<HashMap<String, String>>,

    #[validate(url(message = "Invalid webhook URL"))]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartInstanceRequest {
    pub instance_id: Option<Uuid>,
    pub name: Option<String>,
    pub health_check_config: Option<crate::health_check::HealthCheckConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResponse {
    pub id: Uuid,
    pub name: String,
    pub provider_id: Option<String>,
    pub status: InstanceStatus,
    pub product_id: String,
    pub template_id: TemplateId,
    pub config: InstanceConfig,
    pub timestamps: InstanceTimestamps,
    pub webhook_url: Option<String>,
    pub last_error: Option<String>,
    pub health_check: Option<HealthCheckBlock>,
}

impl From<Instance> for InstanceResponse {
    fn from(instance: Instance) -> Self {
        Self {
            id: instance.id,
            name: instance.name,
            provider_id: instance.provider_id,
            status: instance.status,
            product_id: instance.product_id,
            template_id: instance.template_id,
            config: instance.config,
            timestamps: instance.timestamps,
            webhook_url: instance.webhook_url,
            last_error: instance.last_error,
            health_check: instance.health_check,
        }
    }
}

/// Response body for `POST /api/instances`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceResponse {
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    pub message: String,
    pub estimated_ready_time: DateTime<Utc>,
}
