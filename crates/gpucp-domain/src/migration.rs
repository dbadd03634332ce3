//! Types shared between the migration scheduler and its HTTP status
//! surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Network,
    Timeout,
    RateLimit,
    Api,
    Scheduling,
    Migration,
    Configuration,
    Eligibility,
}

impl FailureCategory {
    pub fn recoverable(self) -> bool {
        !matches!(self, FailureCategory::Configuration | FailureCategory::Eligibility)
    }

    /// `api` failures are retryable depending on the upstream HTTP
    /// status; every other recoverable category is unconditionally
    /// retryable.
    pub fn retryable(self, api_status: Option<u16>) -> bool {
        match self {
            FailureCategory::Configuration | FailureCategory::Eligibility => false,
            FailureCategory::Api => matches!(api_status, Some(s) if s >= 500 || s == 429),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    Migrated,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationHistoryEntry {
    pub instance_id: Uuid,
    pub original_provider_id: String,
    pub new_provider_id: Option<String>,
    pub outcome: MigrationOutcome,
    pub category: Option<FailureCategory>,
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStats {
    pub total_ticks: u64,
    pub total_migrated: u64,
    pub total_failed: u64,
    pub total_skipped: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}
