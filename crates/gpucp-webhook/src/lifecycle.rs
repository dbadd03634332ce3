//! Builders for the canonical lifecycle payloads named by the event
//! catalogue: each constructs the right `reason`/`error` wording for
//! its kind so callers never hand-format these strings.

use gpucp_domain::health_check::HealthCheckBlock;
use gpucp_domain::webhook::{WebhookEventKind, WebhookPayload};
use uuid::Uuid;

#[cfg(test)]
use gpucp_domain::health_check::{HealthCheckConfig, HealthCheckPhase};

pub fn creating_initiated(instance_id: Uuid) -> WebhookPayload {
    WebhookPayload::new(instance_id, WebhookEventKind::CreatingInitiated)
}

pub fn running(instance_id: Uuid, novita_instance_id: String) -> WebhookPayload {
    let mut payload = WebhookPayload::new(instance_id, WebhookEventKind::Running);
    payload.novita_instance_id = Some(novita_instance_id);
    payload
}

pub fn health_checking(instance_id: Uuid) -> WebhookPayload {
    WebhookPayload::new(instance_id, WebhookEventKind::HealthChecking)
        .with_reason("Health checks started")
}

pub fn ready(instance_id: Uuid, health_check: HealthCheckBlock, elapsed_ms: u64) -> WebhookPayload {
    let mut payload = WebhookPayload::new(instance_id, WebhookEventKind::Ready)
        .with_reason("Instance is ready — all health checks passed");
    payload.health_check = Some(health_check);
    payload.elapsed_time = Some(elapsed_ms);
    payload
}

pub fn failed(instance_id: Uuid, reason: impl Into<String>, error: impl Into<String>) -> WebhookPayload {
    WebhookPayload::new(instance_id, WebhookEventKind::Failed)
        .with_reason(reason)
        .with_error(error)
}

pub fn timeout(instance_id: Uuid, timeout_ms: u64) -> WebhookPayload {
    WebhookPayload::new(instance_id, WebhookEventKind::Timeout)
        .with_reason(format!("Instance startup timeout after {timeout_ms}ms"))
}

pub fn stopped(instance_id: Uuid) -> WebhookPayload {
    WebhookPayload::new(instance_id, WebhookEventKind::Stopped)
}

pub fn migrated(
    instance_id: Uuid,
    new_novita_instance_id: String,
    original_novita_instance_id: String,
) -> WebhookPayload {
    let mut payload = WebhookPayload::new(instance_id, WebhookEventKind::Migrated);
    payload.novita_instance_id = Some(new_novita_instance_id);
    payload.data = Some(serde_json::json!({
        "originalInstanceId": original_novita_instance_id,
    }));
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_reason_includes_the_millisecond_budget() {
        let payload = timeout(Uuid::new_v4(), 45_000);
        assert_eq!(
            payload.reason.as_deref(),
            Some("Instance startup timeout after 45000ms")
        );
    }

    #[test]
    fn ready_carries_health_check_block_and_elapsed_time() {
        let block = HealthCheckBlock {
            phase: HealthCheckPhase::Healthy,
            config: HealthCheckConfig {
                timeout_per_check_ms: 5000,
                retry_attempts: 3,
                retry_delay_ms: 1000,
                max_wait_time_ms: 60_000,
                target_port: None,
            },
            attempts: vec![],
            started_at: chrono::Utc::now(),
            completed_at: None,
        };
        let payload = ready(Uuid::new_v4(), block, 1200);
        assert!(payload.health_check.is_some());
        assert_eq!(payload.elapsed_time, Some(1200));
    }
}
