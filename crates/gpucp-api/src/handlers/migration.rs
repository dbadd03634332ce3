//! Status, history, and manual trigger for the spot-migration sweep.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use gpucp_domain::job::{Job, JobPayload, Priority};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::auth::ApiCredential;
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::state::ApiState;

pub async fn status(State(state): State<ApiState>, _cred: ApiCredential) -> Json<Value> {
    let stats = state.registry.migration_stats.lock().unwrap().clone();
    Json(json!({
        "enabled": state.registry.config.migration.enabled,
        "intervalMinutes": state.registry.config.migration.interval_minutes,
        "dryRun": state.registry.config.migration.dry_run,
        "logLevel": state.registry.config.migration.log_level,
        "totalTicks": stats.total_ticks,
        "totalMigrated": stats.total_migrated,
        "totalFailed": stats.total_failed,
        "totalSkipped": stats.total_skipped,
        "lastTickAt": stats.last_tick_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn history(
    State(state): State<ApiState>,
    _cred: ApiCredential,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let history = state.registry.migration_history.lock().unwrap();
    let entries: Vec<_> = history
        .iter()
        .rev()
        .take(query.limit.min(500))
        .cloned()
        .collect();
    Json(json!({ "entries": entries }))
}

/// Scans for eligible instances and enqueues one migrate-spot job per
/// candidate (up to the concurrency cap), so the actual migrations run
/// on the worker pool with queue-level retries rather than inside the
/// request.
pub async fn trigger(
    State(state): State<ApiState>,
    _cred: ApiCredential,
    ctx: RequestContext,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let cancel = CancellationToken::new();
    let candidates = gpucp_core::scheduler::migration::scan_eligible(&state.registry, &cancel)
        .await
        .map_err(|e| {
            ApiError::new(
                gpucp_common::error::Error::Internal(e),
                ctx.request_id,
                ctx.correlation_id,
            )
        })?;

    let registry = &state.registry;
    let cap = registry.config.migration.max_concurrent as usize;
    let mut job_ids = Vec::new();
    for (instance_id, provider_id) in candidates.into_iter().take(cap) {
        let job = Job::new(
            JobPayload::MigrateSpot {
                instance_id,
                provider_id,
            },
            Priority::High,
            registry.config.jobs.max_attempts,
        );
        registry
            .queue
            .enqueue(&job)
            .await
            .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;
        job_ids.push(job.id);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "triggered": true, "enqueued": job_ids.len(), "jobIds": job_ids })),
    ))
}

