//! Scans running/ready instances for idle time past the configured
//! threshold and stops the ones that qualify.

use chrono::Utc;
use gpucp_common::error::Result;
use gpucp_domain::instance::InstanceStatus;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::registry::ServiceRegistry;
use crate::scheduler::autostop::idle_candidates;

pub async fn handle(
    registry: &ServiceRegistry,
    dry_run: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let candidates = idle_candidates(registry);

    if dry_run {
        for instance in &candidates {
            info!(
                instance_id = %instance.id,
                name = %instance.name,
                idle_minutes = instance.idle_for(Utc::now()).num_minutes(),
                "auto-stop dry run: would stop"
            );
        }
        info!(candidates = candidates.len(), "auto-stop dry run complete");
        return Ok(());
    }

    let mut stopped = 0u32;
    for instance in candidates {
        if cancel.is_cancelled() {
            break;
        }
        let Some(provider_id) = instance.provider_id.clone() else {
            continue;
        };

        let reserved = registry
            .store
            .update(instance.id, |i| {
                if matches!(i.status, InstanceStatus::Running | InstanceStatus::Ready) {
                    i.status = InstanceStatus::Stopping;
                    i.timestamps.stopping = Some(Utc::now());
                }
            })
            .await?;

        if reserved.status != InstanceStatus::Stopping {
            // Lost the race to a concurrent start/use; leave it alone.
            continue;
        }

        let correlation_id = Uuid::new_v4();
        match registry
            .provider
            .stop_instance(&provider_id, correlation_id, cancel)
            .await
        {
            Ok(_) => {
                registry
                    .store
                    .update(instance.id, |i| {
                        i.status = InstanceStatus::Stopped;
                        i.timestamps.stopped = Some(Utc::now());
                    })
                    .await?;

                if let Some(url) = &instance.webhook_url {
                    let payload = gpucp_webhook::lifecycle::stopped(instance.id);
                    registry.enqueue_webhook(instance.id, url, &payload).await;
                }
                stopped += 1;
            }
            Err(e) => {
                error!(instance_id = %instance.id, error = %e, "auto-stop failed to stop instance");
                registry
                    .store
                    .update(instance.id, |i| i.status = InstanceStatus::Running)
                    .await?;
            }
        }
    }

    if stopped > 0 {
        info!(stopped, "auto-stop check complete");
    }
    Ok(())
}
