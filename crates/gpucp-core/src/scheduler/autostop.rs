//! Ticks on a fixed interval and enqueues a single `auto-stop-check`
//! job; the job handler does the actual candidate scan so the queue
//! sees the work item even if no worker is free to run it instantly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gpucp_domain::instance::{Instance, InstanceStatus};
use gpucp_domain::job::{Job, JobPayload, Priority};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::registry::ServiceRegistry;
use crate::store::InstanceFilter;

/// Instances currently idle past the configured threshold. Shared by
/// the job handler (which stops them) and the HTTP stats/trigger
/// surface (which only reports on them).
pub fn idle_candidates(registry: &ServiceRegistry) -> Vec<Instance> {
    let filter = InstanceFilter {
        status: Some(vec![InstanceStatus::Running, InstanceStatus::Ready]),
        region: None,
    };
    let threshold =
        chrono::Duration::minutes(registry.config.auto_stop.inactivity_threshold_minutes as i64);
    let now = Utc::now();

    registry
        .store
        .list(&filter)
        .into_iter()
        .filter(|i| i.idle_for(now) >= threshold)
        .collect()
}

pub async fn run(
    registry: Arc<ServiceRegistry>,
    _cancel: CancellationToken,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval_secs = u64::from(registry.config.auto_stop.interval_minutes) * 60;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let job = Job::new(
                    JobPayload::AutoStopCheck { dry_run: false },
                    Priority::Normal,
                    registry.config.jobs.max_attempts,
                );
                if let Err(e) = registry.queue.enqueue(&job).await {
                    error!(error = %e, "failed to enqueue auto-stop-check job");
                } else {
                    info!("auto-stop-check tick enqueued");
                }
            }
            _ = shutdown.recv() => {
                info!("auto-stop scheduler stopping");
                break;
            }
        }
    }
}
