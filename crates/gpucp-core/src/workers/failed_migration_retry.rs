//! Retries a migration that previously failed with a retryable
//! category. Records the repeat failure in the history ledger either
//! way; only retryable categories bounce back to the queue.

use chrono::Utc;
use gpucp_common::error::Result;
use gpucp_domain::migration::{MigrationHistoryEntry, MigrationOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::registry::ServiceRegistry;
use crate::scheduler::migration::{api_status, categorize, migrate_one};

pub async fn handle(
    registry: &ServiceRegistry,
    instance_id: Uuid,
    provider_id: String,
    previous_error: String,
    cancel: &CancellationToken,
) -> Result<()> {
    match migrate_one(registry, instance_id, &provider_id, cancel).await {
        Ok(_) => {
            info!(%instance_id, previous_error, "failed migration retry succeeded");
            Ok(())
        }
        Err(e) => {
            let category = categorize(&e);
            warn!(%instance_id, previous_error, error = %e, ?category, "failed migration retry failed again");

            registry
                .record_migration(MigrationHistoryEntry {
                    instance_id,
                    original_provider_id: provider_id,
                    new_provider_id: None,
                    outcome: MigrationOutcome::Failed,
                    category: Some(category),
                    error: Some(e.to_string()),
                    occurred_at: Utc::now(),
                    dry_run: false,
                })
                .await;

            if category.retryable(api_status(&e)) {
                Err(e)
            } else {
                Ok(())
            }
        }
    }
}
