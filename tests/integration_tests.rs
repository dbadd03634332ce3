/*!
 * Integration tests for the control plane's components.
 *
 * These validate component behavior against real collaborators
 * (mock HTTP servers, a live Redis) without running the full daemon:
 * - Provider client policy: retry with Retry-After, circuit breaker,
 *   rate limiter spacing
 * - Webhook delivery with HMAC signatures over the exact body
 * - Durable job queue ordering, dedup, retry, and crash recovery
 * - Instance store name uniqueness and last-used monotonicity
 *
 * For full lifecycle tests (create -> ready, spot migration), see
 * e2e_tests.rs.
 *
 * Requirements for the `#[ignore]` tests:
 * - Redis running on localhost:6379 (or REDIS_URL set)
 *
 * Run with: cargo test --test integration_tests -- --include-ignored
 */

use std::time::{Duration, Instant};

use gpucp_common::auth::{sign_hmac, verify_hmac};
use gpucp_common::error::Error;
use gpucp_domain::instance::{
    Instance, InstanceConfig, InstanceStatus, InstanceTimestamps, TemplateId,
};
use gpucp_domain::job::{Job, JobPayload, JobStatus, Priority};
use gpucp_domain::webhook::{WebhookEventKind, WebhookPayload};
use gpucp_provider::{ProviderClient, ProviderClientConfig, RequestQueue};
use gpucp_queue::{JobQueue, QueueConfig};
use gpucp_webhook::WebhookDispatcher;
use serial_test::serial;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn provider_client(base_url: String, max_retries: u32, breaker_threshold: u32) -> ProviderClient {
    ProviderClient::new(ProviderClientConfig {
        base_url,
        api_credential: "test-credential".to_string(),
        request_timeout: Duration::from_secs(5),
        rate_limit_window: Duration::from_secs(1),
        rate_limit_max_requests: 100,
        circuit_breaker_threshold: breaker_threshold,
        circuit_breaker_timeout: Duration::from_secs(60),
        max_retries,
        retry_base_delay: Duration::from_millis(10),
    })
    .expect("client builds")
}

fn instance_body(id: &str, status: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": "alpha",
        "status": status,
        "region": "us-east",
    })
}

// ---------------------------------------------------------------------------
// Provider client
// ---------------------------------------------------------------------------

#[tokio::test]
async fn provider_client_honors_retry_after_on_429() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/instances/abc"))
        .respond_with(
            ResponseTemplate::new(429).insert_header("Retry-After", "1"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/instances/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(instance_body("abc", "running")))
        .mount(&server)
        .await;

    let client = provider_client(server.uri(), 3, 10);
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let instance = client
        .get_instance("abc", Uuid::new_v4(), &cancel)
        .await
        .expect("second attempt succeeds");

    assert_eq!(instance.status, "running");
    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "client must wait at least the advertised Retry-After"
    );
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn provider_client_does_not_retry_plain_4xx() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/instances/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = provider_client(server.uri(), 5, 10);
    let cancel = CancellationToken::new();

    let err = client
        .get_instance("missing", Uuid::new_v4(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ProviderClient { status: 404, .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn circuit_opens_after_threshold_failures_without_issuing_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/instances/down"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    // One attempt per call so each call records exactly one failure.
    let client = provider_client(server.uri(), 1, 5);
    let cancel = CancellationToken::new();

    for _ in 0..5 {
        let err = client
            .get_instance("down", Uuid::new_v4(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderClient { status: 500, .. }));
    }

    let err = client
        .get_instance("down", Uuid::new_v4(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CircuitOpen));

    // The sixth call failed fast: the upstream saw only five requests.
    assert_eq!(server.received_requests().await.unwrap().len(), 5);
}

#[tokio::test]
async fn rate_limiter_spaces_out_requests() {
    let queue = RequestQueue::new(Duration::from_millis(300), 1);
    let cancel = CancellationToken::new();

    let started = Instant::now();
    for _ in 0..3 {
        queue.acquire(&cancel).await.expect("not cancelled");
    }

    // First slot is free; the next two each wait a full window.
    assert!(started.elapsed() >= Duration::from_millis(550));
}

// ---------------------------------------------------------------------------
// Webhook dispatcher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn webhook_signature_verifies_against_the_exact_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let secret = "integration-test-secret";
    let dispatcher = WebhookDispatcher::new(
        Duration::from_secs(5),
        3,
        Duration::from_millis(1),
        secret.to_string(),
    )
    .unwrap();

    let payload = WebhookPayload::new(Uuid::new_v4(), WebhookEventKind::Ready);
    let outcome = dispatcher
        .dispatch(&format!("{}/hook", server.uri()), &payload, None)
        .await;
    assert!(outcome.success);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let body = std::str::from_utf8(&request.body).unwrap();
    let signature = request
        .headers
        .get("X-Webhook-Signature")
        .expect("signature header present")
        .to_str()
        .unwrap();
    let hex = signature
        .strip_prefix("sha256=")
        .expect("signature uses the sha256= prefix");

    assert!(verify_hmac(body, hex, secret));
    assert_eq!(sign_hmac(body, secret), hex);

    let timestamp = request
        .headers
        .get("X-Webhook-Timestamp")
        .expect("timestamp header present")
        .to_str()
        .unwrap();
    timestamp.parse::<i64>().expect("timestamp is epoch seconds");
}

#[tokio::test]
async fn webhook_body_uses_the_canonical_field_names() {
    let mut payload = WebhookPayload::new(Uuid::new_v4(), WebhookEventKind::Migrated);
    payload.novita_instance_id = Some("prov-2".to_string());
    payload.elapsed_time = Some(1200);

    let json = serde_json::to_value(&payload).unwrap();
    assert!(json.get("instanceId").is_some());
    assert!(json.get("novitaInstanceId").is_some());
    assert!(json.get("elapsedTime").is_some());
    assert!(json.get("instance_id").is_none());
}

// ---------------------------------------------------------------------------
// Durable job queue (requires Redis)
// ---------------------------------------------------------------------------

async fn test_queue(stale_timeout_ms: i64) -> JobQueue {
    JobQueue::new(QueueConfig {
        redis_url: redis_url(),
        key_prefix: format!("gpucp-test:{}", Uuid::new_v4()),
        backoff_base_ms: 10,
        backoff_max_ms: 1_000,
        processing_stale_timeout_ms: stale_timeout_ms,
    })
    .await
    .expect("queue connects to redis")
}

fn check_job(priority: Priority, max_attempts: u32) -> Job {
    Job::new(JobPayload::AutoStopCheck { dry_run: false }, priority, max_attempts)
}

#[tokio::test]
#[serial]
#[ignore]
async fn lease_follows_priority_then_creation_order() {
    let queue = test_queue(60_000).await;

    let low = check_job(Priority::Low, 3);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let normal_old = check_job(Priority::Normal, 3);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let normal_new = check_job(Priority::Normal, 3);
    let critical = check_job(Priority::Critical, 3);

    queue.enqueue(&low).await.unwrap();
    queue.enqueue(&normal_new).await.unwrap();
    queue.enqueue(&normal_old).await.unwrap();
    queue.enqueue(&critical).await.unwrap();

    let order: Vec<Uuid> = [
        queue.lease("w").await.unwrap().unwrap().id,
        queue.lease("w").await.unwrap().unwrap().id,
        queue.lease("w").await.unwrap().unwrap().id,
        queue.lease("w").await.unwrap().unwrap().id,
    ]
    .to_vec();

    assert_eq!(order, vec![critical.id, normal_old.id, normal_new.id, low.id]);
    assert!(queue.lease("w").await.unwrap().is_none());
}

#[tokio::test]
#[serial]
#[ignore]
async fn re_enqueueing_a_processing_job_is_a_no_op() {
    let queue = test_queue(60_000).await;
    let job = check_job(Priority::Normal, 3);

    queue.enqueue(&job).await.unwrap();
    let leased = queue.lease("w").await.unwrap().unwrap();
    assert_eq!(leased.id, job.id);
    assert_eq!(leased.status, JobStatus::Processing);

    queue.enqueue(&job).await.unwrap();
    assert!(
        queue.lease("w").await.unwrap().is_none(),
        "a job in processing must not reappear in the ready queue"
    );
}

#[tokio::test]
#[serial]
#[ignore]
async fn failed_job_retries_after_backoff_until_attempts_exhausted() {
    let queue = test_queue(60_000).await;
    let job = check_job(Priority::Normal, 2);
    queue.enqueue(&job).await.unwrap();

    let mut leased = queue.lease("w").await.unwrap().unwrap();
    leased.attempts += 1;
    queue.fail(leased, "transient").await.unwrap();

    // Not ready until the backoff elapses and a sweep promotes it.
    assert!(queue.lease("w").await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    queue.promote().await.unwrap();

    let mut retried = queue.lease("w").await.unwrap().unwrap();
    assert_eq!(retried.id, job.id);
    assert_eq!(retried.attempts, 1);
    assert_eq!(retried.error.as_deref(), Some("transient"));

    // Second failure exhausts max_attempts: the job lands in `failed`
    // and never comes back.
    retried.attempts += 1;
    queue.fail(retried, "transient again").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    queue.promote().await.unwrap();
    assert!(queue.lease("w").await.unwrap().is_none());
}

#[tokio::test]
#[serial]
#[ignore]
async fn stale_processing_entries_are_recovered_by_the_sweep() {
    let queue = test_queue(100).await;
    let job = check_job(Priority::Normal, 5);
    queue.enqueue(&job).await.unwrap();

    // Lease and "crash": never complete or fail.
    queue.lease("crashed-worker").await.unwrap().unwrap();
    assert!(queue.lease("w").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(250)).await;
    let promoted = queue.promote().await.unwrap();
    assert!(promoted >= 1);

    let recovered = queue.lease("w").await.unwrap().unwrap();
    assert_eq!(recovered.id, job.id);
    assert_eq!(recovered.attempts, 1, "recovery counts as a burned attempt");
}

#[tokio::test]
#[serial]
#[ignore]
async fn job_record_round_trips_through_the_queue() {
    let queue = test_queue(60_000).await;
    let job = Job::new(
        JobPayload::MonitorInstance {
            instance_id: Uuid::new_v4(),
            start_time: chrono::Utc::now(),
            max_wait_time_ms: 600_000,
        },
        Priority::High,
        5,
    );
    queue.enqueue(&job).await.unwrap();

    let leased = queue.lease("w").await.unwrap().unwrap();
    assert_eq!(leased.id, job.id);
    assert_eq!(leased.created_at, job.created_at);
    assert_eq!(leased.priority, Priority::High);
    match leased.payload {
        JobPayload::MonitorInstance {
            instance_id,
            start_time,
            max_wait_time_ms,
        } => {
            let JobPayload::MonitorInstance {
                instance_id: original_id,
                start_time: original_start,
                ..
            } = job.payload
            else {
                unreachable!()
            };
            assert_eq!(instance_id, original_id);
            assert_eq!(start_time, original_start);
            assert_eq!(max_wait_time_ms, 600_000);
        }
        other => panic!("payload changed shape: {other:?}"),
    }

    assert!(leased.processed_at.is_some());
    queue.complete(leased).await.unwrap();
}

// ---------------------------------------------------------------------------
// Instance store (requires Redis)
// ---------------------------------------------------------------------------

fn sample_instance(name: &str) -> Instance {
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
        webhook_url: None,
        last_error: None,
        health_check: None,
        spot_reclaim_time: None,
        spot_status: None,
    }
}

#[tokio::test]
#[serial]
#[ignore]
async fn duplicate_names_conflict_until_the_holder_terminates() {
    let prefix = format!("gpucp-test:{}", Uuid::new_v4());
    let store = gpucp_core::InstanceStore::new(&redis_url(), &prefix)
        .await
        .unwrap();

    let first = store.create(sample_instance("beta")).await.unwrap();
    let err = store.create(sample_instance("beta")).await.unwrap_err();
    assert!(matches!(err, Error::NameConflict(_)));

    store
        .update(first.id, |i| i.status = InstanceStatus::Terminated)
        .await
        .unwrap();

    // Terminated instances release their name.
    store.create(sample_instance("beta")).await.unwrap();
}

#[tokio::test]
#[serial]
#[ignore]
async fn touch_last_used_rejects_regressions_without_mutating() {
    let prefix = format!("gpucp-test:{}", Uuid::new_v4());
    let store = gpucp_core::InstanceStore::new(&redis_url(), &prefix)
        .await
        .unwrap();
    let instance = store.create(sample_instance("gamma")).await.unwrap();

    let now = chrono::Utc::now();
    store.touch_last_used(instance.id, Some(now)).await.unwrap();

    let stale = now - chrono::Duration::minutes(5);
    let err = store
        .touch_last_used(instance.id, Some(stale))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let current = store.get(instance.id).unwrap();
    assert_eq!(current.timestamps.last_used, Some(now));
}

#[tokio::test]
#[serial]
#[ignore]
async fn provider_id_index_follows_a_migration_swap() {
    let prefix = format!("gpucp-test:{}", Uuid::new_v4());
    let store = gpucp_core::InstanceStore::new(&redis_url(), &prefix)
        .await
        .unwrap();
    let instance = store.create(sample_instance("delta")).await.unwrap();

    store
        .update(instance.id, |i| i.provider_id = Some("prov-old".into()))
        .await
        .unwrap();
    assert!(store.get_by_provider_id("prov-old").is_some());

    store
        .update(instance.id, |i| i.provider_id = Some("prov-new".into()))
        .await
        .unwrap();
    assert!(store.get_by_provider_id("prov-old").is_none());
    assert_eq!(
        store.get_by_provider_id("prov-new").map(|i| i.id),
        Some(instance.id)
    );
}

#[tokio::test]
#[serial]
#[ignore]
async fn indices_rebuild_from_redis_on_startup() {
    let prefix = format!("gpucp-test:{}", Uuid::new_v4());
    let url = redis_url();

    let store = gpucp_core::InstanceStore::new(&url, &prefix).await.unwrap();
    let instance = store.create(sample_instance("epsilon")).await.unwrap();
    store
        .update(instance.id, |i| i.provider_id = Some("prov-e".into()))
        .await
        .unwrap();
    drop(store);

    let rebuilt = gpucp_core::InstanceStore::new(&url, &prefix).await.unwrap();
    assert_eq!(rebuilt.get_by_name("epsilon").map(|i| i.id), Some(instance.id));
    assert_eq!(
        rebuilt.get_by_provider_id("prov-e").map(|i| i.id),
        Some(instance.id)
    );
}
