//! # gpucp-queue
//!
//! A Redis-backed durable job queue: priority-scored sorted set for
//! ready work, a retry sorted set for backoff, a processing hash for
//! crash recovery, and capped completed/failed lists for post-mortem.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use gpucp_common::error::Result;
use gpucp_domain::job::{Job, JobStatus};
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info, warn};

const COMPLETED_CAP: isize = 1_000;
const FAILED_CAP: isize = 1_000;

pub struct QueueConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub processing_stale_timeout_ms: i64,
}

pub struct JobQueue {
    conn: ConnectionManager,
    prefix: String,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
    processing_stale_timeout_ms: i64,
}

impl JobQueue {
    pub async fn new(config: QueueConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: config.key_prefix,
            backoff_base_ms: config.backoff_base_ms,
            backoff_max_ms: config.backoff_max_ms,
            processing_stale_timeout_ms: config.processing_stale_timeout_ms,
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn data_key(&self, job_id: &uuid::Uuid) -> String {
        format!("{}:data:{}", self.prefix, job_id)
    }

    /// Store the job record and add it to the ready queue. Runs as a
    /// Lua script so a reader never observes the sorted-set entry
    /// without the backing data, and so a job ID already present in
    /// any of {queue, processing, retry} is a no-op rather than a
    /// duplicate entry.
    pub async fn enqueue(&self, job: &Job) -> Result<()> {
        const SCRIPT: &str = r#"
            local job_id = ARGV[1]
            if redis.call('ZSCORE', KEYS[1], job_id)
                or redis.call('HEXISTS', KEYS[2], job_id) == 1
                or redis.call('ZSCORE', KEYS[3], job_id)
            then
                return 0
            end
            redis.call('SET', KEYS[4], ARGV[2])
            redis.call('ZADD', KEYS[1], ARGV[3], job_id)
            return 1
        "#;

        let data = serde_json::to_string(job)?;
        let score = job.queue_score();

        let mut conn = self.conn.clone();
        let added: i64 = Script::new(SCRIPT)
            .key(self.key("queue"))
            .key(self.key("processing"))
            .key(self.key("retry"))
            .key(self.data_key(&job.id))
            .arg(job.id.to_string())
            .arg(&data)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;

        if added == 1 {
            debug!(job_id = %job.id, score, "enqueued job");
        } else {
            debug!(job_id = %job.id, "job already queued or in flight, enqueue skipped");
        }
        Ok(())
    }

    /// Atomically pop the highest-ranked job and move it into the
    /// processing hash. Returns `None` when the queue is empty.
    ///
    /// Implemented as a Lua script so the pop-highest-and-mark-running
    /// sequence is indivisible: two workers racing `lease()` must
    /// never both receive the same job ID.
    pub async fn lease(&self, worker_id: &str) -> Result<Option<Job>> {
        const SCRIPT: &str = r#"
            local ready = redis.call('ZREVRANGE', KEYS[1], 0, 0)
            if #ready == 0 then
                return false
            end
            local job_id = ready[1]
            redis.call('ZREM', KEYS[1], job_id)
            redis.call('HSET', KEYS[2], job_id, ARGV[1])
            return job_id
        "#;

        let started_at = now_ms().to_string();
        let entry = format!("{}|{}", started_at, worker_id);

        let mut conn = self.conn.clone();
        let job_id: Option<String> = Script::new(SCRIPT)
            .key(self.key("queue"))
            .key(self.key("processing"))
            .arg(entry)
            .invoke_async(&mut conn)
            .await?;

        let Some(job_id) = job_id else {
            return Ok(None);
        };

        let raw: Option<String> = conn.get(format!("{}:data:{}", self.prefix, job_id)).await?;
        let Some(raw) = raw else {
            warn!(job_id, "leased job id had no backing data, dropping");
            return Ok(None);
        };

        let mut job: Job = serde_json::from_str(&raw)?;
        job.status = JobStatus::Processing;
        job.processed_at = Some(Utc::now());
        self.save(&job).await?;

        info!(job_id = %job.id, worker_id, "leased job");
        Ok(Some(job))
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let data = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.data_key(&job.id), data).await?;
        Ok(())
    }

    pub async fn complete(&self, mut job: Job) -> Result<()> {
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        self.save(&job).await?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hdel(self.key("processing"), job.id.to_string())
            .lpush(self.key("completed"), job.id.to_string())
            .ltrim(self.key("completed"), 0, COMPLETED_CAP - 1)
            .hincr(self.key("stats"), "completed", 1)
            .query_async::<()>(&mut conn)
            .await?;

        info!(job_id = %job.id, "job completed");
        Ok(())
    }

    /// Records a failed attempt. If attempts remain, schedules a
    /// retry with jittered exponential backoff; otherwise moves the
    /// job to the capped `failed` list.
    pub async fn fail(&self, mut job: Job, err: &str) -> Result<()> {
        job.error = Some(err.to_string());
        let mut conn = self.conn.clone();

        if job.attempts < job.max_attempts {
            // `job.attempts` already counts the attempt that just failed
            // (the caller increments before calling `fail`), so the
            // backoff exponent uses the prior attempt count: first
            // retry waits `base_ms`, not `base_ms * 2`.
            let delay_ms = retry_delay_ms(
                job.attempts.saturating_sub(1),
                self.backoff_base_ms,
                self.backoff_max_ms,
            );
            let retry_at = now_ms() + delay_ms as i64;
            job.status = JobStatus::Pending;
            job.next_retry_at = Some(
                chrono::DateTime::<Utc>::from_timestamp_millis(retry_at).unwrap_or_else(Utc::now),
            );
            self.save(&job).await?;

            redis::pipe()
                .atomic()
                .hdel(self.key("processing"), job.id.to_string())
                .zadd(self.key("retry"), job.id.to_string(), retry_at)
                .query_async::<()>(&mut conn)
                .await?;

            warn!(job_id = %job.id, attempts = job.attempts, retry_at, "job failed, scheduled retry");
        } else {
            job.status = JobStatus::Failed;
            self.save(&job).await?;

            redis::pipe()
                .atomic()
                .hdel(self.key("processing"), job.id.to_string())
                .lpush(self.key("failed"), job.id.to_string())
                .ltrim(self.key("failed"), 0, FAILED_CAP - 1)
                .hincr(self.key("stats"), "failed", 1)
                .query_async::<()>(&mut conn)
                .await?;

            warn!(job_id = %job.id, attempts = job.attempts, "job permanently failed");
        }

        Ok(())
    }

    /// Schedules `job` to become ready again after `delay_ms`, without
    /// touching its attempt count. For callers (like the instance
    /// startup poll) that manage their own retry budget against a
    /// deadline and must not be cut short by the queue's generic
    /// `max_attempts`/backoff used by `fail`.
    pub async fn schedule_after(&self, job: &Job, delay_ms: u64) -> Result<()> {
        let data = serde_json::to_string(job)?;
        let retry_at = now_ms() + delay_ms as i64;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set(self.data_key(&job.id), &data)
            .zadd(self.key("retry"), job.id.to_string(), retry_at)
            .query_async::<()>(&mut conn)
            .await?;

        debug!(job_id = %job.id, retry_at, "scheduled self-managed retry");
        Ok(())
    }

    /// Periodic sweep: move due retry entries back to `queue`, and
    /// re-enqueue processing entries that have gone stale (the worker
    /// that leased them crashed before completing or failing them).
    pub async fn promote(&self) -> Result<u32> {
        let now = now_ms();
        let mut conn = self.conn.clone();
        let mut promoted = 0u32;

        let due: Vec<String> = conn
            .zrangebyscore(self.key("retry"), 0, now)
            .await?;
        for job_id in due {
            let raw: Option<String> = conn.get(format!("{}:data:{}", self.prefix, job_id)).await?;
            let Some(raw) = raw else { continue };
            let job: Job = serde_json::from_str(&raw)?;

            redis::pipe()
                .atomic()
                .zrem(self.key("retry"), &job_id)
                .zadd(self.key("queue"), &job_id, job.queue_score())
                .query_async::<()>(&mut conn)
                .await?;
            promoted += 1;
        }

        let processing: Vec<(String, String)> =
            conn.hgetall(self.key("processing")).await?;
        for (job_id, entry) in processing {
            let started_at: i64 = entry
                .split('|')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(now);

            if now - started_at > self.processing_stale_timeout_ms {
                let raw: Option<String> =
                    conn.get(format!("{}:data:{}", self.prefix, job_id)).await?;
                let Some(raw) = raw else { continue };
                let mut job: Job = serde_json::from_str(&raw)?;
                job.attempts += 1;
                job.status = JobStatus::Pending;
                self.save(&job).await?;

                redis::pipe()
                    .atomic()
                    .hdel(self.key("processing"), &job_id)
                    .zadd(self.key("queue"), &job_id, job.queue_score())
                    .query_async::<()>(&mut conn)
                    .await?;

                warn!(job_id, attempts = job.attempts, "recovered crashed job");
                promoted += 1;
            }
        }

        Ok(promoted)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn retry_delay_ms(attempts: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << attempts.min(20)).min(max_ms);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    ((exp as f64) * jitter) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucp_domain::job::{JobPayload, Priority};

    #[test]
    fn retry_delay_respects_the_configured_cap() {
        let delay = retry_delay_ms(10, 1_000, 30_000);
        assert!(delay <= (30_000.0 * 1.2) as u64);
    }

    #[test]
    fn retry_delay_grows_with_attempts() {
        let low = retry_delay_ms(0, 1_000, 30_000);
        let high = retry_delay_ms(3, 1_000, 30_000);
        assert!(high > low);
    }

    fn _sample_job() -> Job {
        Job::new(
            JobPayload::AutoStopCheck { dry_run: false },
            Priority::Normal,
            3,
        )
    }

    #[test]
    fn queue_score_is_deterministic_for_a_fresh_job() {
        let job = _sample_job();
        assert!(job.queue_score() > 0.0);
    }
}
