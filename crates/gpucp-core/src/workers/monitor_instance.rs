//! Polls the provider until the instance reports running, then runs
//! the health-check sweep. One invocation does one poll; if the
//! instance isn't running yet this schedules its own follow-up poll
//! job directly on the queue's retry set, bounded by `max_wait_time_ms`
//! and independent of the queue's generic `max_attempts` cap (which
//! governs unrelated job failures, not this deadline).

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use gpucp_common::error::{Error, Result};
use gpucp_domain::health_check::Transport;
use gpucp_domain::instance::InstanceStatus;
use gpucp_domain::job::{Job, JobPayload, Priority};
use gpucp_domain::startup::StartupPhase;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::health_check::{self, SweepOutcome};
use crate::registry::ServiceRegistry;

/// The provider addresses an instance's exposed ports through a
/// per-instance DNS name derived from its provider ID.
fn instance_host(provider_id: &str) -> String {
    format!("{provider_id}.instances.provider.example")
}

/// Provider statuses that mean the instance is done trying to start.
/// Anything else non-"running" is still in flight and worth another
/// poll.
fn provider_status_is_terminal(status: &str) -> bool {
    matches!(
        status.to_lowercase().as_str(),
        "failed" | "error" | "terminated" | "exited"
    )
}

/// The endpoint list announced with the first `health_checking`
/// webhook: every declared port, status pending, nothing probed yet.
fn pending_block(
    host: &str,
    endpoints: &[(u16, Transport)],
    config: &gpucp_domain::health_check::HealthCheckConfig,
) -> gpucp_domain::health_check::HealthCheckBlock {
    use gpucp_domain::health_check::{
        EndpointStatus, HealthCheckAttempt, HealthCheckBlock, HealthCheckPhase,
    };

    let attempts = endpoints
        .iter()
        .map(|&(port, transport)| HealthCheckAttempt {
            port,
            url: match transport {
                Transport::Http => format!("http://{host}:{port}/"),
                Transport::Https => format!("https://{host}:{port}/"),
                Transport::Tcp | Transport::Udp => format!("{host}:{port}"),
            },
            transport,
            status: EndpointStatus::Pending,
            last_checked: Utc::now(),
            response_time_ms: 0,
            error: None,
        })
        .collect();

    HealthCheckBlock {
        phase: HealthCheckPhase::Pending,
        config: config.clone(),
        attempts,
        started_at: Utc::now(),
        completed_at: None,
    }
}

pub async fn handle(
    registry: &ServiceRegistry,
    instance_id: Uuid,
    start_time: DateTime<Utc>,
    max_wait_time_ms: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(instance) = registry.store.get(instance_id) else {
        warn!(%instance_id, "monitor_instance job for unknown instance, dropping");
        return Ok(());
    };

    if instance.status.is_terminal() {
        return Ok(());
    }

    let Some(provider_id) = instance.provider_id.clone() else {
        return Err(Error::Internal(anyhow!(
            "instance {instance_id} has no provider id yet"
        )));
    };

    let deadline = start_time + chrono::Duration::milliseconds(max_wait_time_ms as i64);
    let correlation_id = Uuid::new_v4();

    let defaults = registry.config.health_check.clone();
    let health_config = gpucp_domain::health_check::HealthCheckConfig {
        timeout_per_check_ms: defaults.timeout_ms,
        retry_attempts: defaults.retry_attempts,
        retry_delay_ms: defaults.retry_delay_ms,
        max_wait_time_ms: max_wait_time_ms.min(defaults.max_wait_time_ms),
        target_port: None,
    };
    let endpoints: Vec<(u16, Transport)> = instance
        .config
        .ports
        .iter()
        .map(|p| (p.port, p.transport))
        .collect();
    let host = instance_host(&provider_id);

    if instance.status == InstanceStatus::Starting {
        let provider_instance = registry
            .provider
            .get_instance(&provider_id, correlation_id, cancel)
            .await?;

        if !provider_instance.status.eq_ignore_ascii_case("running") {
            if provider_status_is_terminal(&provider_instance.status) {
                return fail_instance(registry, instance_id, &provider_instance.status, &instance)
                    .await;
            }
            if Utc::now() >= deadline {
                return timeout_instance(registry, instance_id, max_wait_time_ms, &instance, vec![])
                    .await;
            }
            return reschedule_poll(registry, instance_id, start_time, max_wait_time_ms).await;
        }

        registry
            .startup
            .advance(instance_id, StartupPhase::InstanceRunning);
        registry
            .store
            .update(instance_id, |i| i.status = InstanceStatus::HealthChecking)
            .await?;
        registry
            .startup
            .advance(instance_id, StartupPhase::HealthCheckStarted);

        if let Some(url) = &instance.webhook_url {
            let payload = gpucp_webhook::lifecycle::running(instance_id, provider_id.clone());
            registry.enqueue_webhook(instance_id, url, &payload).await;

            let mut payload = gpucp_webhook::lifecycle::health_checking(instance_id);
            payload.health_check = Some(pending_block(&host, &endpoints, &health_config));
            registry.enqueue_webhook(instance_id, url, &payload).await;
        }
    }

    if endpoints.is_empty() {
        return ready_instance(registry, instance_id, start_time, vec![], &instance).await;
    }

    match health_check::run(&host, &endpoints, &health_config, cancel).await {
        SweepOutcome::Healthy(attempts) => {
            ready_instance(registry, instance_id, start_time, attempts, &instance).await
        }
        SweepOutcome::Timeout(attempts) => {
            timeout_instance(registry, instance_id, max_wait_time_ms, &instance, attempts).await
        }
        SweepOutcome::Cancelled => {
            info!(%instance_id, "health check sweep cancelled by shutdown");
            Ok(())
        }
    }
}

/// Re-enqueues this same poll via the queue's retry set (not `fail`,
/// which would burn the job's generic attempt budget and could exhaust
/// it well before `max_wait_time_ms`, stranding the instance with no
/// `Failed` transition or timeout webhook).
async fn reschedule_poll(
    registry: &ServiceRegistry,
    instance_id: Uuid,
    start_time: DateTime<Utc>,
    max_wait_time_ms: u64,
) -> Result<()> {
    let job = Job::new(
        JobPayload::MonitorInstance {
            instance_id,
            start_time,
            max_wait_time_ms,
        },
        Priority::Normal,
        registry.config.jobs.max_attempts,
    );
    registry
        .queue
        .schedule_after(&job, registry.config.health_check.retry_delay_ms)
        .await?;
    Ok(())
}

async fn ready_instance(
    registry: &ServiceRegistry,
    instance_id: Uuid,
    start_time: DateTime<Utc>,
    attempts: Vec<gpucp_domain::health_check::HealthCheckAttempt>,
    instance: &gpucp_domain::instance::Instance,
) -> Result<()> {
    let elapsed_ms = (Utc::now() - start_time).num_milliseconds().max(0) as u64;
    let defaults = &registry.config.health_check;
    let health_block = gpucp_domain::health_check::HealthCheckBlock {
        phase: gpucp_domain::health_check::HealthCheckPhase::Healthy,
        config: gpucp_domain::health_check::HealthCheckConfig {
            timeout_per_check_ms: defaults.timeout_ms,
            retry_attempts: defaults.retry_attempts,
            retry_delay_ms: defaults.retry_delay_ms,
            max_wait_time_ms: defaults.max_wait_time_ms,
            target_port: None,
        },
        attempts,
        started_at: start_time,
        completed_at: Some(Utc::now()),
    };

    registry
        .startup
        .advance(instance_id, StartupPhase::HealthCheckCompleted);
    registry.startup.advance(instance_id, StartupPhase::Ready);

    registry
        .store
        .update(instance_id, |i| {
            i.status = InstanceStatus::Ready;
            i.timestamps.ready = Some(Utc::now());
            i.health_check = Some(health_block.clone());
        })
        .await?;

    if let Some(url) = &instance.webhook_url {
        let payload = gpucp_webhook::lifecycle::ready(instance_id, health_block, elapsed_ms);
        registry.enqueue_webhook(instance_id, url, &payload).await;
    }

    info!(%instance_id, elapsed_ms, "instance ready");
    Ok(())
}

async fn timeout_instance(
    registry: &ServiceRegistry,
    instance_id: Uuid,
    max_wait_time_ms: u64,
    instance: &gpucp_domain::instance::Instance,
    attempts: Vec<gpucp_domain::health_check::HealthCheckAttempt>,
) -> Result<()> {
    registry.startup.fail(instance_id, "startup deadline exceeded");
    registry
        .store
        .update(instance_id, |i| {
            i.status = InstanceStatus::Failed;
            i.last_error = Some(format!("startup timeout after {max_wait_time_ms}ms"));
            i.timestamps.failed = Some(Utc::now());
        })
        .await?;

    if let Some(url) = &instance.webhook_url {
        let mut payload = gpucp_webhook::lifecycle::timeout(instance_id, max_wait_time_ms);
        // Per-endpoint diagnostics from the last sweep, when the
        // deadline fell inside health checking rather than startup.
        if !attempts.is_empty() {
            payload.data = Some(serde_json::json!({ "endpoints": attempts }));
        }
        registry.enqueue_webhook(instance_id, url, &payload).await;
    }

    warn!(%instance_id, max_wait_time_ms, "instance startup timed out");
    Ok(())
}

/// The provider gave up on this instance before our deadline did:
/// record the failure and emit `failed`, not `timeout`.
async fn fail_instance(
    registry: &ServiceRegistry,
    instance_id: Uuid,
    provider_status: &str,
    instance: &gpucp_domain::instance::Instance,
) -> Result<()> {
    let error_msg = format!("provider reported status '{provider_status}' during startup");
    registry.startup.fail(instance_id, error_msg.clone());

    let store_msg = error_msg.clone();
    registry
        .store
        .update(instance_id, move |i| {
            i.status = InstanceStatus::Failed;
            i.last_error = Some(store_msg);
            i.timestamps.failed = Some(Utc::now());
        })
        .await?;

    if let Some(url) = &instance.webhook_url {
        let payload =
            gpucp_webhook::lifecycle::failed(instance_id, "Instance failed to start", error_msg);
        registry.enqueue_webhook(instance_id, url, &payload).await;
    }

    warn!(%instance_id, provider_status, "instance failed during startup");
    Ok(())
}
