//! Fixed-interval sweep of the provider's instance list, migrating
//! spot-reclaimed instances (up to a concurrency cap) and recording
//! outcomes to the bounded history.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gpucp_common::error::Error;
use gpucp_domain::instance::InstanceStatus;
use gpucp_domain::job::{Job, JobPayload, Priority};
use gpucp_domain::migration::{FailureCategory, MigrationHistoryEntry, MigrationOutcome};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::registry::ServiceRegistry;

/// Eligible when the provider reports the instance has exited due to
/// a spot reclaim (a plain user-initiated stop also reports `exited`
/// but without a reclaim time/status, and must be skipped).
fn is_eligible(status: &str, spot_reclaim_time: Option<&str>, spot_status: Option<&str>) -> bool {
    status.eq_ignore_ascii_case("exited")
        && spot_reclaim_time.is_some_and(|t| t != "0")
        && spot_status.is_some_and(|s| !s.is_empty())
}

pub(crate) fn categorize(err: &Error) -> FailureCategory {
    match err {
        Error::Network { .. } => FailureCategory::Network,
        Error::ProviderTimeout(_) => FailureCategory::Timeout,
        Error::RateLimit { .. } => FailureCategory::RateLimit,
        Error::ProviderClient { .. } | Error::CircuitOpen => FailureCategory::Api,
        _ => FailureCategory::Migration,
    }
}

pub(crate) fn api_status(err: &Error) -> Option<u16> {
    match err {
        Error::ProviderClient { status, .. } => Some(*status),
        _ => None,
    }
}

/// Migrates one reclaimed instance end to end: issues the provider
/// migrate call, swaps the stored provider-ID while the instance is
/// `migrating`, confirms the replacement is up before reporting it
/// `running`, records the outcome, and notifies the instance's
/// webhook. Returns the new provider ID.
pub(crate) async fn migrate_one(
    registry: &ServiceRegistry,
    instance_id: Uuid,
    provider_id: &str,
    cancel: &CancellationToken,
) -> gpucp_common::error::Result<String> {
    let correlation_id = Uuid::new_v4();
    let migrated = registry
        .provider
        .migrate_instance(provider_id, correlation_id, cancel)
        .await?;

    let new_provider_id = migrated.id.clone();
    registry
        .store
        .update(instance_id, |i| {
            i.provider_id = Some(new_provider_id.clone());
            i.status = InstanceStatus::Migrating;
        })
        .await?;

    // Confirmation is best-effort: the migrate already happened, so a
    // failed readback must not bounce this job into another migrate
    // call against the old provider ID. An unconfirmed instance stays
    // `migrating` until the next sweep observes it.
    if let Ok(confirmed) = registry
        .provider
        .get_instance(&new_provider_id, correlation_id, cancel)
        .await
    {
        if confirmed.status.eq_ignore_ascii_case("running") {
            registry
                .store
                .update(instance_id, |i| {
                    i.status = InstanceStatus::Running;
                    i.timestamps.started = Some(Utc::now());
                    i.spot_reclaim_time = None;
                    i.spot_status = None;
                })
                .await?;
        }
    }

    {
        let mut stats = registry.migration_stats.lock().unwrap();
        stats.total_migrated += 1;
    }
    registry
        .record_migration(MigrationHistoryEntry {
            instance_id,
            original_provider_id: provider_id.to_string(),
            new_provider_id: Some(new_provider_id.clone()),
            outcome: MigrationOutcome::Migrated,
            category: None,
            error: None,
            occurred_at: Utc::now(),
            dry_run: false,
        })
        .await;

    if let Some(instance) = registry.store.get(instance_id) {
        if let Some(url) = &instance.webhook_url {
            let payload = gpucp_webhook::lifecycle::migrated(
                instance_id,
                new_provider_id.clone(),
                provider_id.to_string(),
            );
            registry.enqueue_webhook(instance_id, url, &payload).await;
        }
    }

    info!(%instance_id, new_provider_id, "instance migrated");
    Ok(new_provider_id)
}

pub async fn run(
    registry: Arc<ServiceRegistry>,
    cancel: CancellationToken,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval_secs = u64::from(registry.config.migration.interval_minutes) * 60;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = tick(&registry, &cancel).await {
                    error!(error = %e, "migration tick failed");
                }
            }
            _ = shutdown.recv() => {
                info!("migration scheduler stopping");
                break;
            }
        }
    }
}

/// Scans the provider's paged instance list for spot-reclaimed
/// candidates that have a local record. Returns (internal ID, provider
/// ID) pairs. Shared by the periodic sweep, which migrates inline, and
/// the manual trigger endpoint, which enqueues a migrate-spot job per
/// candidate.
pub async fn scan_eligible(
    registry: &Arc<ServiceRegistry>,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<(Uuid, String)>> {
    let correlation_id = Uuid::new_v4();
    let mut page_token = None;
    let mut candidates = Vec::new();

    loop {
        let page = registry
            .provider
            .list_instances(page_token.as_deref(), correlation_id, cancel)
            .await?;
        for instance in &page.items {
            if is_eligible(
                &instance.status,
                instance.spot_reclaim_time.as_deref(),
                instance.spot_status.as_deref(),
            ) {
                if let Some(local) = registry.store.get_by_provider_id(&instance.id) {
                    candidates.push((local.id, instance.id.clone()));
                }
            }
        }
        page_token = page.next_page;
        if page_token.is_none() {
            break;
        }
    }

    Ok(candidates)
}

/// Runs one migration sweep immediately: scan, then migrate up to the
/// concurrency cap inline.
pub async fn tick(registry: &Arc<ServiceRegistry>, cancel: &CancellationToken) -> anyhow::Result<()> {
    let candidates = scan_eligible(registry, cancel).await?;

    {
        let mut stats = registry.migration_stats.lock().unwrap();
        stats.total_ticks += 1;
        stats.last_tick_at = Some(Utc::now());
    }
    registry.persist_migration_stats().await;

    let cap = registry.config.migration.max_concurrent as usize;
    for (instance_id, provider_id) in candidates.into_iter().take(cap) {
        if registry.config.migration.dry_run {
            info!(provider_id, "migration dry run: would migrate");
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
            continue;
        }

        match migrate_one(registry, instance_id, &provider_id, cancel).await {
            Ok(_) => {}
            Err(err) => {
                let category = categorize(&err);
                warn!(provider_id, ?category, error = %err, "migration failed");

                {
                    let mut stats = registry.migration_stats.lock().unwrap();
                    stats.total_failed += 1;
                }
                registry
                    .record_migration(MigrationHistoryEntry {
                        instance_id,
                        original_provider_id: provider_id.clone(),
                        new_provider_id: None,
                        outcome: MigrationOutcome::Failed,
                        category: Some(category),
                        error: Some(err.to_string()),
                        occurred_at: Utc::now(),
                        dry_run: false,
                    })
                    .await;

                if registry.config.migration.retry_failed
                    && category.retryable(api_status(&err))
                {
                    let job = Job::new(
                        JobPayload::FailedMigrationRetry {
                            instance_id,
                            provider_id: provider_id.clone(),
                            previous_error: err.to_string(),
                        },
                        Priority::High,
                        registry.config.jobs.max_attempts,
                    );
                    if let Err(e) = registry.queue.enqueue(&job).await {
                        error!(error = %e, "failed to enqueue failed-migration-retry job");
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exited_with_spot_reclaim_is_eligible() {
        assert!(is_eligible("exited", Some("1700000000"), Some("reclaimed")));
    }

    #[test]
    fn plain_user_stop_is_not_eligible() {
        assert!(!is_eligible("exited", Some("0"), None));
        assert!(!is_eligible("exited", None, None));
    }

    #[test]
    fn non_exited_status_is_never_eligible() {
        assert!(!is_eligible("running", Some("1700000000"), Some("reclaimed")));
    }
}
