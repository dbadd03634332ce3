//! Read-only view and manual trigger for the auto-stop scheduler.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use gpucp_core::scheduler::autostop::idle_candidates;
use gpucp_domain::job::{Job, JobPayload, Priority};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::ApiCredential;
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::state::ApiState;

pub async fn stats(State(state): State<ApiState>, _cred: ApiCredential) -> Json<Value> {
    let registry = &state.registry;
    let candidates = idle_candidates(registry);

    Json(json!({
        "enabled": registry.config.auto_stop.enabled,
        "intervalMinutes": registry.config.auto_stop.interval_minutes,
        "inactivityThresholdMinutes": registry.config.auto_stop.inactivity_threshold_minutes,
        "idleCandidateCount": candidates.len(),
        "idleCandidateIds": candidates.iter().map(|i| i.id).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    dry_run: Option<bool>,
}

/// Manually triggered checks default to a dry run; the caller has to
/// say `dryRun: false` explicitly to make a manual trigger stop
/// anything. The body is optional, so it's read as raw bytes rather
/// than a rejecting `Json` extractor.
pub async fn trigger(
    State(state): State<ApiState>,
    _cred: ApiCredential,
    ctx: RequestContext,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let dry_run = serde_json::from_slice::<TriggerRequest>(&body)
        .ok()
        .and_then(|r| r.dry_run)
        .unwrap_or(true);

    let registry = &state.registry;
    let job = Job::new(
        JobPayload::AutoStopCheck { dry_run },
        Priority::High,
        registry.config.jobs.max_attempts,
    );
    registry
        .queue
        .enqueue(&job)
        .await
        .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "triggered": true, "dryRun": dry_run, "jobId": job.id })),
    ))
}
