//! The startup state machine's observable record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPhase {
    StartRequested,
    InstanceStarting,
    InstanceRunning,
    HealthCheckStarted,
    HealthCheckCompleted,
    Ready,
    Failed,
}

impl StartupPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, StartupPhase::Ready | StartupPhase::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupOperation {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub phase: StartupPhase,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Wall-clock deadline for the whole operation (provider startup
    /// plus health checks), unless overridden per-phase by a caller
    /// supplied health-check budget.
    pub deadline: DateTime<Utc>,
}

impl StartupOperation {
    pub fn new(instance_id: Uuid, timeout: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            instance_id,
            phase: StartupPhase::StartRequested,
            started_at: now,
            completed_at: None,
            error: None,
            deadline: now + timeout,
        }
    }

    pub fn advance(&mut self, phase: StartupPhase) {
        self.phase = phase;
        if phase.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.advance(StartupPhase::Failed);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.phase.is_terminal() && now >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_to_ready_sets_completed_at() {
        let mut op = StartupOperation::new(Uuid::new_v4(), chrono::Duration::minutes(10));
        assert!(op.completed_at.is_none());
        op.advance(StartupPhase::Ready);
        assert!(op.completed_at.is_some());
    }

    #[test]
    fn expires_past_deadline_while_non_terminal() {
        let mut op = StartupOperation::new(Uuid::new_v4(), chrono::Duration::seconds(-1));
        assert!(op.is_expired(Utc::now()));
        op.advance(StartupPhase::Ready);
        assert!(!op.is_expired(Utc::now()));
    }
}
