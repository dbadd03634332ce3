//! Typed lifecycle payloads emitted by the webhook dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::health_check::HealthCheckBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookEventKind {
    CreatingInitiated,
    Running,
    HealthChecking,
    Ready,
    Failed,
    Timeout,
    Stopped,
    Migrated,
}

impl WebhookEventKind {
    pub fn as_status(self) -> &'static str {
        match self {
            WebhookEventKind::CreatingInitiated => "creating-initiated",
            WebhookEventKind::Running => "running",
            WebhookEventKind::HealthChecking => "health_checking",
            WebhookEventKind::Ready => "ready",
            WebhookEventKind::Failed => "failed",
            WebhookEventKind::Timeout => "timeout",
            WebhookEventKind::Stopped => "stopped",
            WebhookEventKind::Migrated => "migrated",
        }
    }
}

/// Canonical webhook body. Every field beyond `instance_id`/`status`/
/// `timestamp` is optional and populated only when relevant to the
/// event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub instance_id: Uuid,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub novita_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookPayload {
    pub fn new(instance_id: Uuid, kind: WebhookEventKind) -> Self {
        Self {
            instance_id,
            status: kind.as_status().to_string(),
            timestamp: Utc::now(),
            novita_instance_id: None,
            elapsed_time: None,
            data: None,
            error: None,
            health_check: None,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
