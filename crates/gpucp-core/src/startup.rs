//! Coordinates the startup state machine: one non-terminal
//! [`StartupOperation`] per instance at a time, rejecting duplicate
//! start requests with `StartupInProgress`.

use std::sync::Arc;

use dashmap::DashMap;
use gpucp_common::error::{Error, Result};
use gpucp_domain::startup::{StartupOperation, StartupPhase};
use uuid::Uuid;

pub struct StartupCoordinator {
    operations: DashMap<Uuid, StartupOperation>,
}

impl StartupCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            operations: DashMap::new(),
        })
    }

    pub fn start(&self, instance_id: Uuid, timeout: chrono::Duration) -> Result<StartupOperation> {
        if let Some(existing) = self.operations.get(&instance_id) {
            if !existing.phase.is_terminal() {
                return Err(Error::StartupInProgress);
            }
        }

        let op = StartupOperation::new(instance_id, timeout);
        self.operations.insert(instance_id, op.clone());
        Ok(op)
    }

    pub fn advance(&self, instance_id: Uuid, phase: StartupPhase) {
        if let Some(mut op) = self.operations.get_mut(&instance_id) {
            op.advance(phase);
        }
    }

    pub fn fail(&self, instance_id: Uuid, error: impl Into<String>) {
        if let Some(mut op) = self.operations.get_mut(&instance_id) {
            op.fail(error);
        }
    }

    pub fn get(&self, instance_id: Uuid) -> Option<StartupOperation> {
        self.operations.get(&instance_id).map(|r| r.clone())
    }

    /// Sweeps expired non-terminal operations; called from the
    /// monitor-instance handler on each poll.
    pub fn sweep_expired(&self) -> Vec<Uuid> {
        let now = chrono::Utc::now();
        let mut expired = Vec::new();
        for mut entry in self.operations.iter_mut() {
            if entry.is_expired(now) {
                entry.fail("startup deadline exceeded");
                expired.push(*entry.key());
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_start_while_in_flight_is_rejected() {
        let coordinator = StartupCoordinator::new();
        let instance_id = Uuid::new_v4();
        coordinator
            .start(instance_id, chrono::Duration::minutes(10))
            .unwrap();

        let second = coordinator.start(instance_id, chrono::Duration::minutes(10));
        assert!(matches!(second, Err(Error::StartupInProgress)));
    }

    #[test]
    fn start_succeeds_again_after_the_prior_operation_terminates() {
        let coordinator = StartupCoordinator::new();
        let instance_id = Uuid::new_v4();
        coordinator
            .start(instance_id, chrono::Duration::minutes(10))
            .unwrap();
        coordinator.advance(instance_id, StartupPhase::Ready);

        assert!(coordinator
            .start(instance_id, chrono::Duration::minutes(10))
            .is_ok());
    }
}
