//! Job records processed by the durable job queue and job workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    CreateInstance,
    MonitorInstance,
    SendWebhook,
    AutoStopCheck,
    MigrateSpot,
    FailedMigrationRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Priority ordering: strictly higher value wins; ties broken by
/// earlier creation time (see [`crate::job::Job::queue_score`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

/// Type-dependent job payload. Kept as a tagged enum rather than a
/// bare `serde_json::Value` so handlers get compile-time payload
/// shapes; the queue itself only ever sees the serialized job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    CreateInstance {
        instance_id: Uuid,
    },
    MonitorInstance {
        instance_id: Uuid,
        start_time: DateTime<Utc>,
        max_wait_time_ms: u64,
    },
    SendWebhook {
        instance_id: Uuid,
        webhook_url: String,
        payload: serde_json::Value,
    },
    AutoStopCheck {
        dry_run: bool,
    },
    MigrateSpot {
        instance_id: Uuid,
        provider_id: String,
    },
    FailedMigrationRetry {
        instance_id: Uuid,
        provider_id: String,
        previous_error: String,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::CreateInstance { .. } => JobType::CreateInstance,
            JobPayload::MonitorInstance { .. } => JobType::MonitorInstance,
            JobPayload::SendWebhook { .. } => JobType::SendWebhook,
            JobPayload::AutoStopCheck { .. } => JobType::AutoStopCheck,
            JobPayload::MigrateSpot { .. } => JobType::MigrateSpot,
            JobPayload::FailedMigrationRetry { .. } => JobType::FailedMigrationRetry,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub priority: Priority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(payload: JobPayload, priority: Priority, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            status: JobStatus::Pending,
            priority,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
            next_retry_at: None,
            error: None,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    /// Score for the `queue` sorted set: `priority * STEP + (MAX -
    /// createdAtMs)` so higher priority and earlier creation rank
    /// first when popped with `ZREVRANGE`/max-score-first semantics.
    ///
    /// STEP must exceed any representable `MAX - createdAtMs` so the
    /// priority term strictly dominates, and the whole score must stay
    /// below 2^53 to survive the trip through a redis f64 score intact.
    pub fn queue_score(&self) -> f64 {
        // 2100-01-01T00:00:00Z in epoch milliseconds.
        const MAX_MS: i64 = 4_102_444_800_000;
        const STEP: i64 = 10_000_000_000_000;
        let created_ms = self.created_at.timestamp_millis().clamp(0, MAX_MS);
        ((self.priority as i64) * STEP + (MAX_MS - created_ms)) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_job(priority: Priority) -> Job {
        Job::new(JobPayload::AutoStopCheck { dry_run: false }, priority, 3)
    }

    #[test]
    fn higher_priority_always_outranks_lower_regardless_of_age() {
        let mut older_low = check_job(Priority::Low);
        older_low.created_at = Utc::now() - chrono::Duration::days(30);
        let newer_critical = check_job(Priority::Critical);

        assert!(newer_critical.queue_score() > older_low.queue_score());
    }

    #[test]
    fn same_priority_earlier_creation_wins() {
        let mut first = check_job(Priority::Normal);
        first.created_at = Utc::now() - chrono::Duration::milliseconds(5);
        let second = check_job(Priority::Normal);

        assert!(first.queue_score() > second.queue_score());
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = Job::new(
            JobPayload::MigrateSpot {
                instance_id: Uuid::new_v4(),
                provider_id: "prov-123".into(),
            },
            Priority::High,
            5,
        );

        let json = serde_json::to_string(&job).unwrap();
        let restored: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, job.id);
        assert_eq!(restored.created_at, job.created_at);
        assert_eq!(restored.job_type(), JobType::MigrateSpot);
    }
}
