//! Instance CRUD and lifecycle handlers: create, read, list,
//! comprehensive listing, start/stop by ID or name, and last-used
//! touch. Each handler validates, mutates the `InstanceStore`, and
//! hands the slow work to the durable job queue.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use gpucp_common::error::Error;
use gpucp_domain::health_check::PortDeclaration;
use gpucp_domain::instance::{
    CreateInstanceRequest, CreateInstanceResponse, Instance, InstanceConfig, InstanceResponse,
    InstanceStatus, InstanceTimestamps, StartInstanceRequest,
};
use gpucp_domain::job::{Job, JobPayload, Priority};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;
use validator::Validate;

use crate::auth::ApiCredential;
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::state::ApiState;

pub async fn create_instance(
    State(state): State<ApiState>,
    _cred: ApiCredential,
    ctx: RequestContext,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<CreateInstanceResponse>), ApiError> {
    if let Err(errors) = request.validate() {
        return Err(ApiError::validation(&errors, ctx.request_id, ctx.correlation_id));
    }

    let registry = &state.registry;
    let defaults = &registry.config.defaults;

    let ports = request
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|port| PortDeclaration {
            port,
            transport: gpucp_domain::health_check::Transport::Tcp,
        })
        .collect();

    let instance = Instance {
        id: Uuid::new_v4(),
        name: request.name,
        provider_id: None,
        status: InstanceStatus::Creating,
        product_id: request.product_name,
        template_id: request.template_id,
        config: InstanceConfig {
            gpu_count: request.gpu_count.unwrap_or(defaults.gpu_count),
            rootfs_gb: request.rootfs_gb.unwrap_or(defaults.rootfs_gb),
            region: request.region.unwrap_or_else(|| defaults.region.clone()),
            image_url: request.image_url.unwrap_or_default(),
            image_auth_credential_id: request.image_auth_credential_id,
            ports,
            env: request.env.unwrap_or_default(),
        },
        timestamps: InstanceTimestamps {
            created: Some(Utc::now()),
            ..Default::default()
        },
        webhook_url: request.webhook_url,
        last_error: None,
        health_check: None,
        spot_reclaim_time: None,
        spot_status: None,
    };

    let created = registry
        .store
        .create(instance)
        .await
        .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    let job = Job::new(
        JobPayload::CreateInstance {
            instance_id: created.id,
        },
        Priority::Normal,
        registry.config.jobs.max_attempts,
    );
    registry
        .queue
        .enqueue(&job)
        .await
        .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    let estimated_ready_time =
        Utc::now() + chrono::Duration::milliseconds(registry.config.health_check.max_wait_time_ms as i64);

    Ok((
        StatusCode::CREATED,
        Json(CreateInstanceResponse {
            instance_id: created.id,
            status: created.status,
            message: "Instance creation initiated successfully".to_string(),
            estimated_ready_time,
        }),
    ))
}

pub async fn get_instance(
    State(state): State<ApiState>,
    _cred: ApiCredential,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let instance = state
        .registry
        .store
        .get(id)
        .ok_or_else(|| Error::NotFound(id.to_string()))
        .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    Ok(Json(instance.into()))
}

#[derive(Debug, Deserialize)]
pub struct ListInstancesQuery {
    pub source: Option<String>,
    #[serde(default, rename = "includeNovitaOnly")]
    pub include_novita_only: bool,
    #[serde(default, rename = "syncLocalState")]
    pub sync_local_state: bool,
}

pub async fn list_instances(
    State(state): State<ApiState>,
    _cred: ApiCredential,
    ctx: RequestContext,
    Query(query): Query<ListInstancesQuery>,
) -> Result<Json<Vec<InstanceResponse>>, ApiError> {
    let registry = &state.registry;

    match query.source.as_deref() {
        Some("novita") => {
            let provider_instances = fetch_all_provider_instances(&state, ctx).await?;
            let locally_known: std::collections::HashSet<String> = registry
                .store
                .list(&Default::default())
                .into_iter()
                .filter_map(|i| i.provider_id)
                .collect();

            let views = provider_instances
                .into_iter()
                .filter(|p| !query.include_novita_only || !locally_known.contains(&p.id))
                .map(provider_instance_response)
                .collect();
            Ok(Json(views))
        }
        Some("merged") => {
            let provider_instances = fetch_all_provider_instances(&state, ctx).await?;
            let merged = gpucp_core::merge::comprehensive_list(
                &registry.store,
                provider_instances,
                query.sync_local_state,
                registry.instance_snapshot_cache.hit_ratio(),
            )
            .await;
            Ok(Json(
                merged
                    .instances
                    .into_iter()
                    .map(|view| view.instance.into())
                    .collect(),
            ))
        }
        _ => Ok(Json(
            registry
                .store
                .list(&Default::default())
                .into_iter()
                .map(Into::into)
                .collect(),
        )),
    }
}

pub async fn comprehensive_list(
    State(state): State<ApiState>,
    _cred: ApiCredential,
    ctx: RequestContext,
    Query(query): Query<ListInstancesQuery>,
) -> Result<Json<gpucp_domain::merge::ComprehensiveListResponse>, ApiError> {
    let provider_instances = fetch_all_provider_instances(&state, ctx).await?;
    let response = gpucp_core::merge::comprehensive_list(
        &state.registry.store,
        provider_instances,
        query.sync_local_state,
        state.registry.instance_snapshot_cache.hit_ratio(),
    )
    .await;
    Ok(Json(response))
}

async fn fetch_all_provider_instances(
    state: &ApiState,
    ctx: RequestContext,
) -> Result<Vec<gpucp_provider::wire::ProviderInstance>, ApiError> {
    let registry = &state.registry;
    if let Some(snapshot) = registry.instance_snapshot_cache.get(&()) {
        return Ok(snapshot);
    }

    let correlation_id = ctx.correlation_id.unwrap_or_else(Uuid::new_v4);
    let cancel = tokio_util::sync::CancellationToken::new();
    let mut page_token = None;
    let mut instances = Vec::new();

    loop {
        let page = registry
            .provider
            .list_instances(page_token.as_deref(), correlation_id, &cancel)
            .await
            .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;
        instances.extend(page.items);
        page_token = page.next_page;
        if page_token.is_none() {
            break;
        }
    }

    registry
        .instance_snapshot_cache
        .insert((), instances.clone());
    Ok(instances)
}

fn provider_instance_response(provider: gpucp_provider::wire::ProviderInstance) -> InstanceResponse {
    InstanceResponse {
        id: Uuid::new_v4(),
        name: provider.name,
        provider_id: Some(provider.id),
        status: InstanceStatus::Running,
        product_id: String::new(),
        template_id: gpucp_domain::instance::TemplateId(String::new()),
        config: InstanceConfig {
            gpu_count: 0,
            rootfs_gb: 0,
            region: provider.region,
            image_url: String::new(),
            image_auth_credential_id: None,
            ports: vec![],
            env: HashMap::new(),
        },
        timestamps: InstanceTimestamps::default(),
        webhook_url: None,
        last_error: None,
        health_check: None,
    }
}

fn resolve_target(
    registry: &gpucp_core::ServiceRegistry,
    id: Option<Uuid>,
    name: Option<String>,
) -> Result<Instance, Error> {
    if let Some(id) = id {
        return registry.store.get(id).ok_or_else(|| Error::NotFound(id.to_string()));
    }
    if let Some(name) = name {
        return registry
            .store
            .get_by_name(&name)
            .ok_or_else(|| Error::NotFound(name));
    }
    Err(Error::Validation(
        "either instanceId (path) or name (body) is required".to_string(),
    ))
}

async fn start(
    state: &ApiState,
    ctx: &RequestContext,
    id: Option<Uuid>,
    name: Option<String>,
    health_check_config: Option<gpucp_domain::health_check::HealthCheckConfig>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let registry = &state.registry;
    let instance =
        resolve_target(registry, id, name).map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    // One wall clock covers provider startup plus health checks; a
    // caller-supplied health-check budget narrows only that phase.
    let startup_timeout_ms = registry.config.jobs.startup_timeout.as_millis() as u64;
    let max_wait_time_ms = health_check_config
        .map(|c| c.clamped().max_wait_time_ms)
        .unwrap_or(startup_timeout_ms);

    registry
        .startup
        .start(instance.id, chrono::Duration::milliseconds(startup_timeout_ms as i64))
        .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    let job_payload = if let Some(provider_id) = &instance.provider_id {
        let correlation_id = ctx.correlation_id.unwrap_or_else(Uuid::new_v4);
        let cancel = tokio_util::sync::CancellationToken::new();
        registry
            .provider
            .start_instance(provider_id, correlation_id, &cancel)
            .await
            .map_err(|e| {
                registry.startup.fail(instance.id, e.to_string());
                ApiError::new(e, ctx.request_id, ctx.correlation_id)
            })?;

        JobPayload::MonitorInstance {
            instance_id: instance.id,
            start_time: Utc::now(),
            max_wait_time_ms,
        }
    } else {
        JobPayload::CreateInstance {
            instance_id: instance.id,
        }
    };

    registry
        .store
        .update(instance.id, |i| {
            i.status = InstanceStatus::Starting;
            i.timestamps.started = Some(Utc::now());
        })
        .await
        .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    let job = Job::new(job_payload, Priority::High, registry.config.jobs.max_attempts);
    registry
        .queue
        .enqueue(&job)
        .await
        .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "instanceId": instance.id, "status": "starting" })),
    ))
}

pub async fn start_instance_by_id(
    State(state): State<ApiState>,
    _cred: ApiCredential,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    start(&state, &ctx, Some(id), None, None).await
}

pub async fn start_instance_by_name(
    State(state): State<ApiState>,
    _cred: ApiCredential,
    ctx: RequestContext,
    Json(request): Json<StartInstanceRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    start(
        &state,
        &ctx,
        request.instance_id,
        request.name,
        request.health_check_config,
    )
    .await
}

async fn stop(
    state: &ApiState,
    ctx: &RequestContext,
    id: Option<Uuid>,
    name: Option<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let registry = &state.registry;
    let instance =
        resolve_target(registry, id, name).map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    let Some(provider_id) = instance.provider_id.clone() else {
        return Err(ApiError::new(
            Error::Validation("instance has no provider assignment to stop".to_string()),
            ctx.request_id,
            ctx.correlation_id,
        ));
    };

    registry
        .store
        .update(instance.id, |i| {
            i.status = InstanceStatus::Stopping;
            i.timestamps.stopping = Some(Utc::now());
        })
        .await
        .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    let correlation_id = ctx.correlation_id.unwrap_or_else(Uuid::new_v4);
    let cancel = tokio_util::sync::CancellationToken::new();
    registry
        .provider
        .stop_instance(&provider_id, correlation_id, &cancel)
        .await
        .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    let updated = registry
        .store
        .update(instance.id, |i| {
            i.status = InstanceStatus::Stopped;
            i.timestamps.stopped = Some(Utc::now());
        })
        .await
        .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    if let Some(url) = &updated.webhook_url {
        let payload = gpucp_webhook::lifecycle::stopped(updated.id);
        registry.enqueue_webhook(updated.id, url, &payload).await;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "instanceId": updated.id, "status": "stopped" })),
    ))
}

pub async fn stop_instance_by_id(
    State(state): State<ApiState>,
    _cred: ApiCredential,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    stop(&state, &ctx, Some(id), None).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopByNameRequest {
    pub instance_id: Option<Uuid>,
    pub name: Option<String>,
}

pub async fn stop_instance_by_name(
    State(state): State<ApiState>,
    _cred: ApiCredential,
    ctx: RequestContext,
    Json(request): Json<StopByNameRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    stop(&state, &ctx, request.instance_id, request.name).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastUsedRequest {
    pub last_used: Option<chrono::DateTime<Utc>>,
}

pub async fn touch_last_used(
    State(state): State<ApiState>,
    _cred: ApiCredential,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
    Json(request): Json<LastUsedRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .registry
        .store
        .touch_last_used(id, request.last_used)
        .await
        .map_err(|e| ApiError::new(e, ctx.request_id, ctx.correlation_id))?;

    Ok(StatusCode::NO_CONTENT)
}
