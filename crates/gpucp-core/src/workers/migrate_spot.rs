//! Migrates a single spot-reclaimed instance to a fresh provider
//! instance. The manual trigger endpoint enqueues one of these per
//! eligible instance; the scheduler's own tick migrates its candidates
//! inline.

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
    cancel: &CancellationToken,
) -> Result<()> {
    if registry.config.migration.dry_run {
        info!(%instance_id, provider_id, "migration dry run: would migrate");
        {
            let mut stats = registry.migration_stats.lock().unwrap();
            stats.total_skipped += 1;
        }
        registry
            .record_migration(MigrationHistoryEntry {
                instance_id,
                original_provider_id: provider_id,
                new_provider_id: None,
                outcome: MigrationOutcome::Skipped,
                category: None,
                error: None,
                occurred_at: Utc::now(),
                dry_run: true,
            })
            .await;
        return Ok(());
    }

    match migrate_one(registry, instance_id, &provider_id, cancel).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let category = categorize(&e);
            warn!(%instance_id, provider_id, ?category, error = %e, "migrate-spot job failed");

            {
                let mut stats = registry.migration_stats.lock().unwrap();
                stats.total_failed += 1;
            }
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

            // A retryable category goes back to the queue; anything
            // else is settled.
            if category.retryable(api_status(&e)) {
                Err(e)
            } else {
                Ok(())
            }
        }
    }
}
