//! In-memory instance store with secondary indices, backed by Redis
//! for durability. Reads go straight to the dashmap; mutations run
//! under the owning shard lock, which stands in for the per-instance
//! exclusive lock the state machine needs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gpucp_common::error::{Error, Result};
use gpucp_domain::instance::{Instance, InstanceStatus};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Emitted whenever an instance is created or mutated, so the
/// schedulers can react without polling the whole store.
#[derive(Debug, Clone)]
pub struct InstanceChanged {
    pub id: Uuid,
    pub status: InstanceStatus,
}

#[derive(Debug, Default, Clone)]
pub struct InstanceFilter {
    pub status: Option<Vec<InstanceStatus>>,
    pub region: Option<String>,
}

impl InstanceFilter {
    fn matches(&self, instance: &Instance) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&instance.status) {
                return false;
            }
        }
        if let Some(region) = &self.region {
            if &instance.config.region != region {
                return false;
            }
        }
        true
    }
}

pub struct InstanceStore {
    instances: DashMap<Uuid, Instance>,
    by_name: DashMap<String, Uuid>,
    by_provider_id: DashMap<String, Uuid>,
    redis: ConnectionManager,
    key_prefix: String,
    changes: broadcast::Sender<InstanceChanged>,
}

impl InstanceStore {
    pub async fn new(redis_url: &str, key_prefix: &str) -> Result<Arc<Self>> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        let (changes, _) = broadcast::channel(256);

        let store = Arc::new(Self {
            instances: DashMap::new(),
            by_name: DashMap::new(),
            by_provider_id: DashMap::new(),
            redis,
            key_prefix: key_prefix.to_string(),
            changes,
        });

        store.rebuild_indices_from_redis().await?;
        Ok(store)
    }

    fn data_key(&self, id: &Uuid) -> String {
        format!("{}:instance:{}", self.key_prefix, id)
    }

    async fn rebuild_indices_from_redis(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}:instance:*", self.key_prefix);
        let mut cursor: u64 = 0;
        let mut restored = 0usize;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                let raw: Option<String> = conn.get(&key).await?;
                if let Some(raw) = raw {
                    match serde_json::from_str::<Instance>(&raw) {
                        Ok(instance) => {
                            self.index(&instance);
                            restored += 1;
                        }
                        Err(e) => warn!(key, error = %e, "dropping unreadable instance record"),
                    }
                }
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        info!(restored, "rebuilt instance store secondary indices");
        Ok(())
    }

    fn index(&self, instance: &Instance) {
        self.by_name.insert(instance.name.clone(), instance.id);
        if let Some(pid) = &instance.provider_id {
            self.by_provider_id.insert(pid.clone(), instance.id);
        }
        self.instances.insert(instance.id, instance.clone());
    }

    async fn persist(&self, instance: &Instance) -> Result<()> {
        let data = serde_json::to_string(instance)?;
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(self.data_key(&instance.id), data)
            .await?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceChanged> {
        self.changes.subscribe()
    }

    /// Reserves the name and assigns the instance its internal ID.
    /// Fails with `NameConflict` if another live instance already
    /// holds the name.
    ///
    /// The check-then-insert on `by_name` happens under that name's
    /// shard lock (via `DashMap::entry`), so two concurrent creates for
    /// the same name can never both observe a vacant/dead slot: one
    /// wins the reservation, the other sees it occupied by a live
    /// instance and is rejected.
    pub async fn create(&self, instance: Instance) -> Result<Instance> {
        use dashmap::mapref::entry::Entry;

        // Inserted under its own (freshly generated) id first, so the
        // liveness check below always sees a fully populated record for
        // whichever instance currently holds the name.
        self.instances.insert(instance.id, instance.clone());

        match self.by_name.entry(instance.name.clone()) {
            Entry::Occupied(mut entry) => {
                let existing_id = *entry.get();
                let existing_live = self
                    .instances
                    .get(&existing_id)
                    .map(|e| e.status.is_live())
                    .unwrap_or(false);
                if existing_live {
                    self.instances.remove(&instance.id);
                    return Err(Error::NameConflict(instance.name.clone()));
                }
                entry.insert(instance.id);
            }
            Entry::Vacant(entry) => {
                entry.insert(instance.id);
            }
        }

        if let Err(e) = self.persist(&instance).await {
            self.instances.remove(&instance.id);
            self.by_name.remove_if(&instance.name, |_, id| *id == instance.id);
            return Err(e);
        }

        if let Some(pid) = &instance.provider_id {
            self.by_provider_id.insert(pid.clone(), instance.id);
        }

        let _ = self.changes.send(InstanceChanged {
            id: instance.id,
            status: instance.status,
        });

        debug!(instance_id = %instance.id, name = %instance.name, "created instance");
        Ok(instance)
    }

    pub fn get(&self, id: Uuid) -> Option<Instance> {
        self.instances.get(&id).map(|r| r.clone())
    }

    pub fn get_by_name(&self, name: &str) -> Option<Instance> {
        let id = *self.by_name.get(name)?;
        self.get(id)
    }

    pub fn get_by_provider_id(&self, provider_id: &str) -> Option<Instance> {
        let id = *self.by_provider_id.get(provider_id)?;
        self.get(id)
    }

    pub fn list(&self, filter: &InstanceFilter) -> Vec<Instance> {
        self.instances
            .iter()
            .map(|r| r.clone())
            .filter(|i| filter.matches(i))
            .collect()
    }

    /// Applies `mutator` under the dashmap shard lock for `id`,
    /// persists the result, and publishes a change event.
    pub async fn update<F>(&self, id: Uuid, mutator: F) -> Result<Instance>
    where
        F: FnOnce(&mut Instance),
    {
        let (updated, previous_pid) = {
            let mut entry = self
                .instances
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            let previous_pid = entry.provider_id.clone();
            mutator(&mut entry);
            (entry.clone(), previous_pid)
        };

        // Migration swaps the provider-ID; the old mapping must not
        // keep resolving to this instance.
        if previous_pid != updated.provider_id {
            if let Some(old) = &previous_pid {
                self.by_provider_id.remove_if(old, |_, mapped| *mapped == id);
            }
        }
        if let Some(pid) = &updated.provider_id {
            self.by_provider_id.insert(pid.clone(), id);
        }
        self.persist(&updated).await?;

        let _ = self.changes.send(InstanceChanged {
            id,
            status: updated.status,
        });
        Ok(updated)
    }

    /// `when` defaults to now; rejects times before the current
    /// `lastUsed` without mutating, so clock skew or replayed requests
    /// can't move the idle clock backwards.
    pub async fn touch_last_used(&self, id: Uuid, when: Option<DateTime<Utc>>) -> Result<()> {
        let when = when.unwrap_or_else(Utc::now);
        let mut rejected = None;
        self.update(id, |instance| {
            match instance.timestamps.last_used {
                Some(current) if when < current => rejected = Some(current),
                _ => instance.timestamps.last_used = Some(when),
            }
        })
        .await?;

        match rejected {
            Some(current) => Err(Error::Validation(format!(
                "lastUsed {when} is earlier than the recorded {current}"
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucp_domain::instance::{InstanceConfig, InstanceTimestamps, TemplateId};
    use std::collections::HashMap;

    fn sample(name: &str) -> Instance {
        Instance {
            id: Uuid::new_v4(),
            name: name.to_string(),
            provider_id: None,
            status: InstanceStatus::Creating,
            product_id: "p1".into(),
            template_id: TemplateId("pytorch".into()),
            config: InstanceConfig {
                gpu_count: 1,
                rootfs_gb: 60,
                region: "us-east".into(),
                image_url: "docker.io/pytorch".into(),
                image_auth_credential_id: None,
                ports: vec![],
                env: HashMap::new(),
            },
            timestamps: InstanceTimestamps::default(),
            webhook_url: None,
            last_error: None,
            health_check: None,
            spot_reclaim_time: None,
            spot_status: None,
        }
    }

    #[test]
    fn filter_matches_on_status_and_region() {
        let mut instance = sample("alpha");
        instance.status = InstanceStatus::Running;
        instance.config.region = "us-east".into();

        let filter = InstanceFilter {
            status: Some(vec![InstanceStatus::Running]),
            region: Some("us-east".into()),
        };
        assert!(filter.matches(&instance));

        let wrong_region = InstanceFilter {
            status: None,
            region: Some("eu-west".into()),
        };
        assert!(!wrong_region.matches(&instance));
    }
}
