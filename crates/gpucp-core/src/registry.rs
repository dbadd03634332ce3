//! Composition root: wires the store, provider client, queue, and
//! dispatcher together, runs the worker pool and both schedulers, and
//! coordinates graceful shutdown.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gpucp_config::Config;
use gpucp_domain::job::{Job, JobPayload, Priority};
use gpucp_domain::migration::{MigrationHistoryEntry, MigrationStats};
use gpucp_domain::webhook::WebhookPayload;
use gpucp_provider::wire::{ProviderInstance, ProviderProduct, ProviderTemplate};
use gpucp_provider::{ProviderClient, ProviderClientConfig};
use gpucp_queue::{JobQueue, QueueConfig};
use gpucp_webhook::WebhookDispatcher;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::startup::StartupCoordinator;
use crate::store::InstanceStore;
use crate::workers;

const MIGRATION_HISTORY_CAP: usize = 500;

pub struct ServiceRegistry {
    pub config: Config,
    pub store: Arc<InstanceStore>,
    pub provider: ProviderClient,
    pub queue: Arc<JobQueue>,
    pub webhook: WebhookDispatcher,
    pub startup: Arc<StartupCoordinator>,
    pub migration_stats: Mutex<MigrationStats>,
    pub migration_history: Mutex<Vec<MigrationHistoryEntry>>,
    /// Read-path snapshot of the provider's full instance list; the
    /// migration sweep bypasses this and always reads live.
    pub instance_snapshot_cache: TtlCache<(), Vec<ProviderInstance>>,
    pub template_cache: TtlCache<String, ProviderTemplate>,
    pub product_cache: TtlCache<(String, String), ProviderProduct>,
    redis: ConnectionManager,
    webhook_clock: AtomicI64,
    ready: AtomicBool,
}

impl ServiceRegistry {
    pub async fn build(config: Config) -> anyhow::Result<Arc<Self>> {
        let store = InstanceStore::new(&config.redis.url, &config.redis.key_prefix).await?;

        let provider = ProviderClient::new(ProviderClientConfig {
            base_url: config.provider.base_url.clone(),
            api_credential: config.provider.api_credential.clone(),
            request_timeout: config.provider.request_timeout,
            rate_limit_window: config.provider.rate_limit_window,
            rate_limit_max_requests: config.provider.rate_limit_max_requests,
            circuit_breaker_threshold: config.provider.circuit_breaker_threshold,
            circuit_breaker_timeout: config.provider.circuit_breaker_timeout,
            max_retries: config.provider.max_retries,
            retry_base_delay: config.provider.retry_base_delay,
        })?;

        let queue = Arc::new(
            JobQueue::new(QueueConfig {
                redis_url: config.redis.url.clone(),
                key_prefix: format!("{}:jobs", config.redis.key_prefix),
                backoff_base_ms: config.jobs.backoff_base.as_millis() as u64,
                backoff_max_ms: config.jobs.backoff_max.as_millis() as u64,
                processing_stale_timeout_ms: config.jobs.processing_stale_timeout.as_millis() as i64,
            })
            .await?,
        );

        let webhook = WebhookDispatcher::new(
            config.webhook.timeout,
            config.webhook.max_retries,
            Duration::from_secs(1),
            config.webhook.secret.clone(),
        )?;

        let startup = StartupCoordinator::new();

        let instance_snapshot_cache = TtlCache::new(config.cache.instances_ttl);
        let template_cache = TtlCache::new(config.cache.templates_ttl);
        let product_cache = TtlCache::new(config.cache.products_ttl);

        let redis_client = redis::Client::open(config.redis.url.as_str())?;
        let mut redis = ConnectionManager::new(redis_client).await?;
        let (migration_stats, migration_history) =
            load_migration_state(&mut redis, &config.redis.key_prefix).await;

        Ok(Arc::new(Self {
            config,
            store,
            provider,
            queue,
            webhook,
            startup,
            migration_stats: Mutex::new(migration_stats),
            migration_history: Mutex::new(migration_history),
            instance_snapshot_cache,
            template_cache,
            product_cache,
            redis,
            webhook_clock: AtomicI64::new(0),
            ready: AtomicBool::new(false),
        }))
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Queues a lifecycle webhook as a send-webhook job, so delivery
    /// survives a worker crash and retries on the queue's schedule in
    /// addition to the dispatcher's own attempts. Creation times are
    /// forced strictly increasing: two webhooks emitted within the
    /// same millisecond would otherwise tie on queue score and could
    /// lease out of emission order.
    pub async fn enqueue_webhook(&self, instance_id: Uuid, webhook_url: &str, payload: &WebhookPayload) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                error!(%instance_id, error = %e, "webhook payload failed to serialize");
                return;
            }
        };

        let mut job = Job::new(
            JobPayload::SendWebhook {
                instance_id,
                webhook_url: webhook_url.to_string(),
                payload,
            },
            Priority::Critical,
            self.config.jobs.max_attempts,
        );

        let now_ms = job.created_at.timestamp_millis();
        let mut last = self.webhook_clock.load(Ordering::SeqCst);
        let assigned = loop {
            let next = now_ms.max(last + 1);
            match self
                .webhook_clock
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break next,
                Err(actual) => last = actual,
            }
        };
        if let Some(created_at) = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(assigned) {
            job.created_at = created_at;
        }

        if let Err(e) = self.queue.enqueue(&job).await {
            error!(%instance_id, error = %e, "failed to enqueue webhook delivery job");
        }
    }

    /// Appends to the bounded in-memory history and mirrors both the
    /// entry and the current stats snapshot to redis, so the history
    /// endpoint survives a restart. The persistence is best-effort:
    /// migration outcomes must not fail on a flaky mirror write.
    pub async fn record_migration(&self, entry: MigrationHistoryEntry) {
        {
            let mut history = self.migration_history.lock().unwrap();
            history.push(entry.clone());
            if history.len() > MIGRATION_HISTORY_CAP {
                let overflow = history.len() - MIGRATION_HISTORY_CAP;
                history.drain(0..overflow);
            }
        }

        let Ok(entry_json) = serde_json::to_string(&entry) else {
            return;
        };
        let stats_json = {
            let stats = self.migration_stats.lock().unwrap();
            serde_json::to_string(&*stats).unwrap_or_default()
        };

        let prefix = &self.config.redis.key_prefix;
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<()> = redis::pipe()
            .lpush(format!("{prefix}:migration:history"), entry_json)
            .ltrim(
                format!("{prefix}:migration:history"),
                0,
                MIGRATION_HISTORY_CAP as isize - 1,
            )
            .set(format!("{prefix}:migration:stats"), stats_json)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to persist migration history entry");
        }
    }

    pub async fn persist_migration_stats(&self) {
        let stats_json = {
            let stats = self.migration_stats.lock().unwrap();
            serde_json::to_string(&*stats).unwrap_or_default()
        };
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<()> = conn
            .set(
                format!("{}:migration:stats", self.config.redis.key_prefix),
                stats_json,
            )
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to persist migration stats");
        }
    }

    /// Runs the worker pool, both schedulers, and the queue promotion
    /// sweep until `shutdown` fires, then waits up to the configured
    /// grace period for in-flight handlers to finish before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        // Recover work orphaned by a previous crash before any worker
        // starts leasing: stale processing entries go back to the queue
        // as attempt+1.
        match self.queue.promote().await {
            Ok(0) => {}
            Ok(n) => info!(recovered = n, "recovered interrupted jobs from previous run"),
            Err(e) => warn!(error = %e, "startup recovery sweep failed"),
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        let workers_started = Arc::new(AtomicU32::new(0));

        for worker_id in 0..self.config.jobs.concurrency {
            let registry = Arc::clone(&self);
            let cancel = cancel.clone();
            let mut shutdown_rx = shutdown.resubscribe();
            let started = Arc::clone(&workers_started);
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, registry, cancel, &mut shutdown_rx, started).await;
            }));
        }

        {
            let registry = Arc::clone(&self);
            let cancel = cancel.clone();
            let shutdown_rx = shutdown.resubscribe();
            handles.push(tokio::spawn(promote_loop(registry, cancel, shutdown_rx)));
        }

        handles.push(tokio::spawn(crate::runtime_health::watch(
            shutdown.resubscribe(),
        )));

        if self.config.auto_stop.enabled {
            let registry = Arc::clone(&self);
            let cancel = cancel.clone();
            let shutdown_rx = shutdown.resubscribe();
            handles.push(tokio::spawn(crate::scheduler::autostop::run(
                registry,
                cancel,
                shutdown_rx,
            )));
        }

        if self.config.migration.enabled {
            let registry = Arc::clone(&self);
            let cancel = cancel.clone();
            let shutdown_rx = shutdown.resubscribe();
            handles.push(tokio::spawn(crate::scheduler::migration::run(
                registry,
                cancel,
                shutdown_rx,
            )));
        }

        // Readiness flips only once every worker has completed its
        // first lease attempt against the queue backend.
        {
            let registry = Arc::clone(&self);
            let worker_count = self.config.jobs.concurrency;
            let started = Arc::clone(&workers_started);
            let mut shutdown_rx = shutdown.resubscribe();
            tokio::spawn(async move {
                loop {
                    if started.load(Ordering::SeqCst) >= worker_count {
                        registry.ready.store(true, Ordering::SeqCst);
                        info!(workers = worker_count, "service registry ready");
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }
        info!(workers = self.config.jobs.concurrency, "service registry running");

        let _ = shutdown.recv().await;
        info!("shutdown signal received, cancelling in-flight work");
        cancel.cancel();

        let grace = self.config.jobs.shutdown_grace_period;
        let joined = tokio::time::timeout(grace, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;

        if joined.is_err() {
            warn!(grace_secs = grace.as_secs(), "grace period elapsed, forcing teardown");
        } else {
            info!("all workers stopped cleanly");
        }

        Ok(())
    }
}

async fn load_migration_state(
    conn: &mut ConnectionManager,
    prefix: &str,
) -> (MigrationStats, Vec<MigrationHistoryEntry>) {
    let stats = conn
        .get::<_, Option<String>>(format!("{prefix}:migration:stats"))
        .await
        .ok()
        .flatten()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    let raw_entries: Vec<String> = conn
        .lrange(
            format!("{prefix}:migration:history"),
            0,
            MIGRATION_HISTORY_CAP as isize - 1,
        )
        .await
        .unwrap_or_default();
    // LPUSH stores newest first; the in-memory list is oldest first.
    let mut history: Vec<MigrationHistoryEntry> = raw_entries
        .iter()
        .filter_map(|raw| serde_json::from_str(raw).ok())
        .collect();
    history.reverse();

    (stats, history)
}

async fn worker_loop(
    worker_id: u32,
    registry: Arc<ServiceRegistry>,
    cancel: CancellationToken,
    shutdown: &mut broadcast::Receiver<()>,
    started: Arc<AtomicU32>,
) {
    let mut first_lease_done = false;
    let worker_name = format!("worker-{worker_id}");
    loop {
        tokio::select! {
            leased = registry.queue.lease(&worker_name) => {
                if !first_lease_done {
                    first_lease_done = true;
                    started.fetch_add(1, Ordering::SeqCst);
                }
                match leased {
                    Ok(Some(job)) => {
                        let job_id = job.id;
                        let payload = job.payload.clone();
                        let result = workers::dispatch(&registry, payload, &cancel).await;
                        match result {
                            Ok(()) => {
                                if let Err(e) = registry.queue.complete(job).await {
                                    error!(job_id = %job_id, error = %e, "failed to mark job complete");
                                }
                            }
                            Err(e) => {
                                let mut failed_job = job;
                                failed_job.attempts += 1;
                                if let Err(fail_err) = registry.queue.fail(failed_job, &e.to_string()).await {
                                    error!(job_id = %job_id, error = %fail_err, "failed to record job failure");
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                    Err(e) => {
                        error!(worker_id, error = %e, "lease failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            _ = shutdown.recv() => {
                info!(worker_id, "worker stopping");
                break;
            }
        }
    }
}

async fn promote_loop(
    registry: Arc<ServiceRegistry>,
    _cancel: CancellationToken,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match registry.queue.promote().await {
                    Ok(0) => {}
                    Ok(n) => info!(promoted = n, "promoted jobs from retry/processing"),
                    Err(e) => error!(error = %e, "promote sweep failed"),
                }
            }
            _ = shutdown.recv() => {
                info!("promote loop stopping");
                break;
            }
        }
    }
}
