//! Job handler dispatch: each [`JobPayload`] variant routes to a
//! type-specific handler. Handlers make their state transitions
//! durable before returning `Ok`, so a crash mid-handler can only ever
//! resume from an already-visible state via the queue's stale-sweep.

mod auto_stop_check;
mod create_instance;
mod failed_migration_retry;
mod migrate_spot;
mod monitor_instance;
mod send_webhook;

use gpucp_common::error::Result;
use gpucp_domain::job::JobPayload;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::registry::ServiceRegistry;

#[instrument(skip(registry, cancel), fields(job_kind = ?payload_kind(&payload)))]
pub async fn dispatch(
    registry: &ServiceRegistry,
    payload: JobPayload,
    cancel: &CancellationToken,
) -> Result<()> {
    match payload {
        JobPayload::CreateInstance { instance_id } => {
            create_instance::handle(registry, instance_id, cancel).await
        }
        JobPayload::MonitorInstance {
            instance_id,
            start_time,
            max_wait_time_ms,
        } => {
            monitor_instance::handle(registry, instance_id, start_time, max_wait_time_ms, cancel)
                .await
        }
        JobPayload::SendWebhook {
            instance_id,
            webhook_url,
            payload,
        } => send_webhook::handle(registry, instance_id, webhook_url, payload).await,
        JobPayload::AutoStopCheck { dry_run } => {
            auto_stop_check::handle(registry, dry_run, cancel).await
        }
        JobPayload::MigrateSpot {
            instance_id,
            provider_id,
        } => migrate_spot::handle(registry, instance_id, provider_id, cancel).await,
        JobPayload::FailedMigrationRetry {
            instance_id,
            provider_id,
            previous_error,
        } => {
            failed_migration_retry::handle(registry, instance_id, provider_id, previous_error, cancel)
                .await
        }
    }
}

fn payload_kind(payload: &JobPayload) -> &'static str {
    match payload {
        JobPayload::CreateInstance { .. } => "create_instance",
        JobPayload::MonitorInstance { .. } => "monitor_instance",
        JobPayload::SendWebhook { .. } => "send_webhook",
        JobPayload::AutoStopCheck { .. } => "auto_stop_check",
        JobPayload::MigrateSpot { .. } => "migrate_spot",
        JobPayload::FailedMigrationRetry { .. } => "failed_migration_retry",
    }
}
