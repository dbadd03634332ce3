//! Fuses a provider snapshot with the local store for the
//! comprehensive listing read path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use gpucp_domain::instance::InstanceStatus;
use gpucp_domain::merge::{
    ComprehensiveInstanceView, ComprehensiveListResponse, DataConsistency, MergePerformance, Source,
};
use gpucp_provider::wire::ProviderInstance;
use tracing::debug;

use crate::store::InstanceStore;

/// Maps the provider's free-text status to the closest local enum
/// value for consistency comparison; anything unrecognized is treated
/// as non-comparable and falls back to `novita-newer`.
fn map_provider_status(status: &str) -> Option<InstanceStatus> {
    match status.to_lowercase().as_str() {
        "running" => Some(InstanceStatus::Running),
        "exited" => Some(InstanceStatus::Exited),
        "starting" => Some(InstanceStatus::Starting),
        "stopped" => Some(InstanceStatus::Stopped),
        _ => None,
    }
}

pub async fn comprehensive_list(
    store: &Arc<InstanceStore>,
    provider_instances: Vec<ProviderInstance>,
    sync_local_state: bool,
    cache_hit_ratio: f64,
) -> ComprehensiveListResponse {
    let total_start = Instant::now();

    let local_start = Instant::now();
    let local = store.list(&Default::default());
    let local_fetch_ms = local_start.elapsed().as_millis() as u64;

    let provider_fetch_ms = 0; // caller already paid this cost fetching the snapshot.

    let merge_start = Instant::now();
    let mut provider_by_id: HashMap<String, ProviderInstance> = provider_instances
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();

    let mut views = Vec::new();

    for instance in local {
        let provider_match = instance
            .provider_id
            .as_ref()
            .and_then(|pid| provider_by_id.remove(pid));

        match provider_match {
            None => views.push(ComprehensiveInstanceView {
                instance,
                source: Source::Local,
                data_consistency: DataConsistency::Consistent,
            }),
            Some(provider) => {
                let mapped = map_provider_status(&provider.status);
                let consistency = classify(instance.status, mapped);

                let mut merged = instance;
                merged.spot_reclaim_time = provider.spot_reclaim_time.clone();
                merged.spot_status = provider.spot_status.clone();

                if sync_local_state {
                    if let Some(status) = mapped {
                        let reconciled = reconcile_status(merged.status, status);
                        if reconciled != merged.status {
                            match store.update(merged.id, |i| i.status = reconciled).await {
                                Ok(_) => merged.status = reconciled,
                                Err(e) => {
                                    debug!(instance_id = %merged.id, error = %e, "sync-back skipped")
                                }
                            }
                        }
                    }
                }

                views.push(ComprehensiveInstanceView {
                    instance: merged,
                    source: Source::Merged,
                    data_consistency: consistency,
                });
            }
        }
    }

    for (_, provider) in provider_by_id {
        views.push(ComprehensiveInstanceView {
            instance: provider_only_instance(provider),
            source: Source::Novita,
            data_consistency: DataConsistency::Consistent,
        });
    }

    let merge_ms = merge_start.elapsed().as_millis() as u64;
    let total_ms = total_start.elapsed().as_millis() as u64;

    debug!(count = views.len(), total_ms, "comprehensive list merged");

    ComprehensiveListResponse {
        instances: views,
        performance: MergePerformance {
            local_fetch_ms,
            provider_fetch_ms,
            merge_ms,
            total_ms,
            cache_hit_ratio,
        },
    }
}

/// While the control plane is mid-transition the local record is the
/// fresher side: the provider only learns about a stop or migration
/// once the in-flight call lands. A disagreement in a settled local
/// state means the provider moved on without us.
fn classify(local: InstanceStatus, provider: Option<InstanceStatus>) -> DataConsistency {
    match provider {
        Some(status) if status == local => DataConsistency::Consistent,
        Some(InstanceStatus::Exited) if local == InstanceStatus::Ready => {
            DataConsistency::Conflicted
        }
        _ if matches!(
            local,
            InstanceStatus::Creating
                | InstanceStatus::Starting
                | InstanceStatus::HealthChecking
                | InstanceStatus::Stopping
                | InstanceStatus::Migrating
        ) =>
        {
            DataConsistency::LocalNewer
        }
        _ => DataConsistency::NovitaNewer,
    }
}

/// Never regress `ready` to `creating`; an `exited` report from the
/// provider overrides any non-terminal local state since that always
/// reflects something real happening on the provider side.
fn reconcile_status(local: InstanceStatus, provider: InstanceStatus) -> InstanceStatus {
    if provider == InstanceStatus::Exited && local != InstanceStatus::Terminated {
        return InstanceStatus::Exited;
    }
    if local == InstanceStatus::Ready && provider != InstanceStatus::Exited {
        return local;
    }
    provider
}

fn provider_only_instance(provider: ProviderInstance) -> gpucp_domain::instance::Instance {
    use gpucp_domain::instance::{InstanceConfig, InstanceTimestamps, TemplateId};
    use std::collections::HashMap as Map;

    gpucp_domain::instance::Instance {
        id: uuid::Uuid::new_v4(),
        name: provider.name,
        provider_id: Some(provider.id),
        status: map_provider_status(&provider.status).unwrap_or(InstanceStatus::Running),
        product_id: String::new(),
        template_id: TemplateId(String::new()),
        config: InstanceConfig {
            gpu_count: 0,
            rootfs_gb: 0,
            region: provider.region,
            image_url: String::new(),
            image_auth_credential_id: None,
            ports: vec![],
            env: Map::new(),
        },
        timestamps: InstanceTimestamps::default(),
        webhook_url: None,
        last_error: None,
        health_check: None,
        spot_reclaim_time: provider.spot_reclaim_time,
        spot_status: provider.spot_status,
    }
}
