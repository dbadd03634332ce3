//! Delivers one queued lifecycle webhook. The dispatcher retries
//! transient faults internally; a delivery that still fails comes back
//! as an error so the queue redelivers it on its own schedule, even
//! across a worker restart.

use gpucp_common::error::{Error, Result};
use gpucp_domain::webhook::WebhookPayload;
use tracing::warn;
use uuid::Uuid;

use crate::registry::ServiceRegistry;

pub async fn handle(
    registry: &ServiceRegistry,
    instance_id: Uuid,
    webhook_url: String,
    payload: serde_json::Value,
) -> Result<()> {
    let payload: WebhookPayload = serde_json::from_value(payload)?;
    let outcome = registry.webhook.dispatch(&webhook_url, &payload, None).await;

    if outcome.success {
        return Ok(());
    }

    match outcome.status_code {
        // The endpoint rejected the payload outright; redelivering the
        // same body will not change its mind.
        Some(code) if code < 500 && code != 408 && code != 429 => {
            warn!(%instance_id, code, "webhook rejected permanently, dropping");
            Ok(())
        }
        _ => {
            warn!(
                %instance_id,
                status_code = ?outcome.status_code,
                error = ?outcome.error_message,
                "queued webhook delivery failed, leaving for retry"
            );
            Err(Error::Network {
                message: outcome
                    .error_message
                    .unwrap_or_else(|| "webhook delivery failed".to_string()),
                retryable: true,
            })
        }
    }
}
