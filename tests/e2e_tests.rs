/*!
 * End-to-end lifecycle tests.
 *
 * These run the real composition root (store + queue + workers +
 * provider client + webhook dispatcher) against a mock provider API
 * and a mock webhook receiver, and assert on observable outcomes:
 * instance state transitions, webhook sequences, and provider calls.
 *
 * Covered flows:
 * - create -> starting -> running -> health_checking -> ready, with
 *   the full webhook sequence in order
 * - spot migration: exited + reclaim markers -> migrate -> running,
 *   with the provider-ID swap and `migrated` webhook
 * - auto-stop: dry run touches nothing; a live run stops the idle
 *   instance and emits `stopped`
 *
 * Requirements:
 * - Redis running on localhost:6379 (or REDIS_URL set)
 *
 * Run with: cargo test --test e2e_tests -- --include-ignored
 */

use std::sync::Arc;
use std::time::Duration;

use gpucp_config::{
    ApiConfig, AutoStopConfig, BindConfig, CacheConfig, Config, DefaultsConfig,
    HealthCheckDefaults, JobConfig, MigrationConfig, ObservabilityConfig, ProviderConfig,
    RedisConfig, WebhookConfig,
};
use gpucp_core::ServiceRegistry;
use gpucp_domain::instance::{
    Instance, InstanceConfig, InstanceStatus, InstanceTimestamps, TemplateId,
};
use gpucp_domain::job::{Job, JobPayload, Priority};
use serial_test::serial;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn test_config(provider_base_url: String) -> Config {
    Config {
        bind: BindConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        api: ApiConfig {
            host: "127.0.0.1".into(),
            port: 0,
            metrics_port: 0,
            credential: "e2e-test-api-credential".into(),
        },
        provider: ProviderConfig {
            base_url: provider_base_url,
            api_credential: "e2e-test-provider-credential".into(),
            request_timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(10),
            circuit_breaker_threshold: 50,
            circuit_breaker_timeout: Duration::from_secs(60),
            rate_limit_window: Duration::from_secs(1),
            rate_limit_max_requests: 100,
        },
        webhook: WebhookConfig {
            timeout: Duration::from_secs(5),
            max_retries: 2,
            secret: "e2e-test-webhook-secret".into(),
        },
        defaults: DefaultsConfig {
            region: "us-east".into(),
            gpu_count: 1,
            rootfs_gb: 60,
            region_fallback: vec![],
        },
        auto_stop: AutoStopConfig {
            enabled: false,
            interval_minutes: 5,
            inactivity_threshold_minutes: 20,
        },
        migration: MigrationConfig {
            enabled: false,
            interval_minutes: 15,
            job_timeout: Duration::from_secs(60),
            max_concurrent: 5,
            dry_run: false,
            retry_failed: false,
            log_level: "info".into(),
        },
        health_check: HealthCheckDefaults {
            timeout_ms: 2_000,
            retry_attempts: 0,
            retry_delay_ms: 100,
            max_wait_time_ms: 30_000,
        },
        cache: CacheConfig {
            products_ttl: Duration::from_secs(300),
            templates_ttl: Duration::from_secs(300),
            instances_ttl: Duration::from_secs(10),
        },
        jobs: JobConfig {
            // One worker keeps the queued webhook deliveries in strict
            // lease order, so the sequence assertions are deterministic.
            concurrency: 1,
            max_attempts: 3,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_secs(1),
            processing_stale_timeout: Duration::from_secs(60),
            shutdown_grace_period: Duration::from_secs(2),
            startup_timeout: Duration::from_secs(60),
        },
        redis: RedisConfig {
            url: redis_url(),
            key_prefix: format!("gpucp-e2e:{}", Uuid::new_v4()),
        },
        observability: ObservabilityConfig {
            rust_log: "info".into(),
            metrics_port: 0,
        },
    }
}

fn provider_instance_body(id: &str, status: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": "e2e",
        "status": status,
        "region": "us-east",
    })
}

fn base_instance(name: &str, webhook_url: Option<String>) -> Instance {
    Instance {
        id: Uuid::new_v4(),
        name: name.to_string(),
        provider_id: None,
        status: InstanceStatus::Creating,
        product_id: "RTX 4090 24GB".into(),
        template_id: TemplateId("pytorch".into()),
        config: InstanceConfig {
            gpu_count: 1,
            rootfs_gb: 60,
            region: "us-east".into(),
            image_url: "docker.io/pytorch".into(),
            image_auth_credential_id: None,
            ports: vec![],
            env: std::collections::HashMap::new(),
        },
        timestamps: InstanceTimestamps::default(),
        webhook_url,
        last_error: None,
        health_check: None,
        spot_reclaim_time: None,
        spot_status: None,
    }
}

/// Processes every queued job to completion, for tests that invoke a
/// handler or scheduler directly instead of running the worker pool.
async fn drain_queue(registry: &Arc<ServiceRegistry>) {
    let cancel = CancellationToken::new();
    while let Ok(Some(job)) = registry.queue.lease("drain").await {
        let payload = job.payload.clone();
        match gpucp_core::workers::dispatch(registry, payload, &cancel).await {
            Ok(()) => registry.queue.complete(job).await.unwrap(),
            Err(e) => {
                let mut failed = job;
                failed.attempts += 1;
                registry.queue.fail(failed, &e.to_string()).await.unwrap();
            }
        }
    }
}

async fn webhook_statuses(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|request| {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            body["status"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
#[serial]
#[ignore]
async fn create_reaches_ready_with_the_full_webhook_sequence() {
    let provider = MockServer::start().await;
    let webhooks = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [{
                "id": "prod-1",
                "name": "RTX 4090 24GB",
                "region": "us-east",
                "billingMethod": "spot",
                "pricePerHour": 0.44,
                "available": true,
            }],
            "nextPage": null,
        })))
        .mount(&provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/template/pytorch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Id": "pytorch",
            "image": "docker.io/pytorch",
            "ports": [],
        })))
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/instances/create"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(provider_instance_body("prov-1", "starting")),
        )
        .mount(&provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/instances/prov-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(provider_instance_body("prov-1", "running")),
        )
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&webhooks)
        .await;

    let registry = ServiceRegistry::build(test_config(provider.uri()))
        .await
        .unwrap();

    let instance = registry
        .store
        .create(base_instance("e2e", Some(format!("{}/hook", webhooks.uri()))))
        .await
        .unwrap();

    let job = Job::new(
        JobPayload::CreateInstance {
            instance_id: instance.id,
        },
        Priority::Normal,
        3,
    );
    registry.queue.enqueue(&job).await.unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let run_handle = tokio::spawn(Arc::clone(&registry).run(shutdown_rx));

    // The `ready` webhook rides the queue after the status flips, so
    // wait for the whole delivery sequence rather than the store.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if webhooks.received_requests().await.unwrap().len() >= 4 {
            break;
        }
        if let Some(current) = registry.store.get(instance.id) {
            assert_ne!(
                current.status,
                InstanceStatus::Failed,
                "instance failed: {:?}",
                current.last_error
            );
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "webhook sequence never completed"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    shutdown_tx.send(()).unwrap();
    run_handle.await.unwrap().unwrap();

    let final_state = registry.store.get(instance.id).unwrap();
    assert_eq!(final_state.status, InstanceStatus::Ready);
    assert_eq!(final_state.provider_id.as_deref(), Some("prov-1"));
    assert!(final_state.timestamps.ready.is_some());
    let health = final_state.health_check.expect("health check block recorded");
    assert!(health.completed_at.is_some());

    assert_eq!(
        webhook_statuses(&webhooks).await,
        vec!["creating-initiated", "running", "health_checking", "ready"]
    );
}

#[tokio::test]
#[serial]
#[ignore]
async fn spot_reclaimed_instance_is_migrated_to_a_fresh_provider_instance() {
    let provider = MockServer::start().await;
    let webhooks = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/instances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [{
                "id": "prov-old",
                "name": "spotty",
                "status": "exited",
                "region": "us-east",
                "spotReclaimTime": "1700000000",
                "spotStatus": "reclaimed",
            }],
            "nextPage": null,
        })))
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/instances/prov-old/migrate"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(provider_instance_body("prov-new", "starting")),
        )
        .mount(&provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/instances/prov-new"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(provider_instance_body("prov-new", "running")),
        )
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&webhooks)
        .await;

    let registry = ServiceRegistry::build(test_config(provider.uri()))
        .await
        .unwrap();

    let mut seed = base_instance("spotty", Some(format!("{}/hook", webhooks.uri())));
    seed.provider_id = Some("prov-old".into());
    seed.status = InstanceStatus::Exited;
    let instance = registry.store.create(seed).await.unwrap();

    let cancel = CancellationToken::new();
    gpucp_core::scheduler::migration::tick(&registry, &cancel)
        .await
        .unwrap();
    drain_queue(&registry).await;

    let migrated = registry.store.get(instance.id).unwrap();
    assert_eq!(migrated.provider_id.as_deref(), Some("prov-new"));
    assert_eq!(migrated.status, InstanceStatus::Running);
    assert!(registry.store.get_by_provider_id("prov-old").is_none());
    assert_eq!(
        registry.store.get_by_provider_id("prov-new").map(|i| i.id),
        Some(instance.id)
    );

    let requests = webhooks.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["status"], "migrated");
    assert_eq!(body["novitaInstanceId"], "prov-new");
    assert_eq!(body["data"]["originalInstanceId"], "prov-old");

    let history = registry.migration_history.lock().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].original_provider_id, "prov-old");
    assert_eq!(history[0].new_provider_id.as_deref(), Some("prov-new"));
}

#[tokio::test]
#[serial]
#[ignore]
async fn auto_stop_dry_run_reports_without_stopping() {
    let provider = MockServer::start().await;
    let registry = ServiceRegistry::build(test_config(provider.uri()))
        .await
        .unwrap();

    let mut seed = base_instance("idler", None);
    seed.provider_id = Some("prov-idle".into());
    seed.status = InstanceStatus::Running;
    seed.timestamps.last_used = Some(chrono::Utc::now() - chrono::Duration::minutes(21));
    let instance = registry.store.create(seed).await.unwrap();

    let cancel = CancellationToken::new();
    gpucp_core::workers::dispatch(
        &registry,
        JobPayload::AutoStopCheck { dry_run: true },
        &cancel,
    )
    .await
    .unwrap();

    // No provider call, no state change.
    assert!(provider.received_requests().await.unwrap().is_empty());
    assert_eq!(
        registry.store.get(instance.id).unwrap().status,
        InstanceStatus::Running
    );
}

#[tokio::test]
#[serial]
#[ignore]
async fn auto_stop_live_run_stops_the_idle_instance() {
    let provider = MockServer::start().await;
    let webhooks = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/instances/prov-idle/stop"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(provider_instance_body("prov-idle", "exited")),
        )
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&webhooks)
        .await;

    let registry = ServiceRegistry::build(test_config(provider.uri()))
        .await
        .unwrap();

    let mut seed = base_instance("idler", Some(format!("{}/hook", webhooks.uri())));
    seed.provider_id = Some("prov-idle".into());
    seed.status = InstanceStatus::Running;
    seed.timestamps.last_used = Some(chrono::Utc::now() - chrono::Duration::minutes(21));
    let instance = registry.store.create(seed).await.unwrap();

    let cancel = CancellationToken::new();
    gpucp_core::workers::dispatch(
        &registry,
        JobPayload::AutoStopCheck { dry_run: false },
        &cancel,
    )
    .await
    .unwrap();
    drain_queue(&registry).await;

    let stopped = registry.store.get(instance.id).unwrap();
    assert_eq!(stopped.status, InstanceStatus::Stopped);
    assert!(stopped.timestamps.stopping.is_some());
    assert!(stopped.timestamps.stopped.is_some());

    assert_eq!(provider.received_requests().await.unwrap().len(), 1);
    assert_eq!(webhook_statuses(&webhooks).await, vec!["stopped"]);
}
