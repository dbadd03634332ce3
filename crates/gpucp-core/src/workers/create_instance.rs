//! Resolves a product and template, provisions the instance on the
//! provider, and kicks off startup monitoring.

use std::collections::HashMap;

use chrono::Utc;
use gpucp_common::error::Result;
use gpucp_domain::instance::InstanceStatus;
use gpucp_domain::job::{Job, JobPayload, Priority};
use gpucp_domain::startup::StartupPhase;
use gpucp_provider::client::{resolve_product, template_ports};
use gpucp_provider::wire::{CreateInstanceWireRequest, ProviderEnvVar};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::registry::ServiceRegistry;

pub async fn handle(
    registry: &ServiceRegistry,
    instance_id: Uuid,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(instance) = registry.store.get(instance_id) else {
        warn!(%instance_id, "create_instance job for unknown instance, dropping");
        return Ok(());
    };

    let correlation_id = Uuid::new_v4();

    let outcome = provision(registry, &instance, correlation_id, cancel).await;

    match outcome {
        Ok((provider_instance, ports)) => {
            registry
                .startup
                .advance(instance_id, StartupPhase::InstanceStarting);

            let provider_id = provider_instance.id.clone();
            registry
                .store
                .update(instance_id, |i| {
                    i.provider_id = Some(provider_id.clone());
                    i.status = InstanceStatus::Starting;
                    i.timestamps.started = Some(Utc::now());
                    if i.config.ports.is_empty() {
                        i.config.ports = ports.clone();
                    }
                })
                .await?;

            if let Some(url) = &instance.webhook_url {
                let payload = gpucp_webhook::lifecycle::creating_initiated(instance_id);
                registry.enqueue_webhook(instance_id, url, &payload).await;
            }

            let job = Job::new(
                JobPayload::MonitorInstance {
                    instance_id,
                    start_time: Utc::now(),
                    max_wait_time_ms: registry.config.jobs.startup_timeout.as_millis() as u64,
                },
                Priority::High,
                registry.config.jobs.max_attempts,
            );
            registry.queue.enqueue(&job).await?;

            info!(%instance_id, provider_id = provider_instance.id, "instance provisioned");
            Ok(())
        }
        Err(e) => {
            registry.startup.fail(instance_id, e.to_string());
            registry
                .store
                .update(instance_id, |i| {
                    i.status = InstanceStatus::Failed;
                    i.last_error = Some(e.to_string());
                    i.timestamps.failed = Some(Utc::now());
                })
                .await?;

            if let Some(url) = &instance.webhook_url {
                let payload =
                    gpucp_webhook::lifecycle::failed(instance_id, "Instance creation failed", e.to_string());
                registry.enqueue_webhook(instance_id, url, &payload).await;
            }

            Err(e)
        }
    }
}

async fn provision(
    registry: &ServiceRegistry,
    instance: &gpucp_domain::instance::Instance,
    correlation_id: Uuid,
    cancel: &CancellationToken,
) -> Result<(
    gpucp_provider::wire::ProviderInstance,
    Vec<gpucp_domain::health_check::PortDeclaration>,
)> {
    let product_key = (instance.product_id.clone(), instance.config.region.clone());
    let product = match registry.product_cache.get(&product_key) {
        Some(product) => product,
        None => {
            let product = resolve_product(
                &registry.provider,
                &instance.product_id,
                &instance.config.region,
                &registry.config.defaults.region_fallback,
                None,
                correlation_id,
                cancel,
            )
            .await?;
            registry.product_cache.insert(product_key, product.clone());
            product
        }
    };

    let template = match registry.template_cache.get(&instance.template_id.0) {
        Some(template) => template,
        None => {
            let template = registry
                .provider
                .get_template(&instance.template_id.0, correlation_id, cancel)
                .await?;
            registry
                .template_cache
                .insert(instance.template_id.0.clone(), template.clone());
            template
        }
    };
    let ports = template_ports(&template);

    let image_auth = match &instance.config.image_auth_credential_id {
        Some(credential_id) => {
            let auths = registry
                .provider
                .list_registry_auths(correlation_id, cancel)
                .await?;
            auths
                .into_iter()
                .find(|a| &a.id == credential_id)
                .map(|a| format!("{}:{}", a.username, a.password))
        }
        None => None,
    };

    let env: HashMap<_, _> = instance.config.env.clone();
    let request = CreateInstanceWireRequest {
        name: instance.name.clone(),
        product_id: product.id.clone(),
        template_id: instance.template_id.0.clone(),
        region: product.region.clone(),
        gpu_count: instance.config.gpu_count,
        rootfs_gb: instance.config.rootfs_gb,
        // The template's image is the default; a caller-supplied URL
        // overrides it.
        image: if instance.config.image_url.is_empty() {
            template.image.clone()
        } else {
            instance.config.image_url.clone()
        },
        image_auth,
        env: env
            .into_iter()
            .map(|(key, value)| ProviderEnvVar { key, value })
            .collect(),
    };

    let provider_instance = registry
        .provider
        .create_instance(&request, correlation_id, cancel)
        .await?;

    Ok((provider_instance, ports))
}
