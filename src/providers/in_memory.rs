use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::{OwnerId, Provider, ProviderError};
use crate::{InstanceId, InstanceRecord, InstanceStatus, now_millis};

struct OwnerRow {
    host_type: String,
    expires_at_ms: u64,
}

struct StoredInstance {
    record: InstanceRecord,
    claimed_until_ms: Option<u64>,
}

impl StoredInstance {
    /// Millis at which this instance can be claimed, if it is waiting on a delay at all.
    fn claimable_at(&self) -> Option<u64> {
        if self.record.status != InstanceStatus::Idle {
            return None;
        }
        let due = self.record.runnable_at_ms?;
        Some(self.claimed_until_ms.map_or(due, |until| due.max(until)))
    }
}

#[derive(Default)]
struct State {
    instances: HashMap<InstanceId, StoredInstance>,
    owners: HashMap<OwnerId, OwnerRow>,
}

impl State {
    fn host_type(&self, owner: OwnerId, operation: &str) -> Result<String, ProviderError> {
        match self.owners.get(&owner) {
            Some(row) if row.expires_at_ms > now_millis() => Ok(row.host_type.clone()),
            Some(_) => Err(ProviderError::lease_lost(operation, format!("owner {owner} expired"))),
            None => Err(ProviderError::lease_lost(operation, format!("owner {owner} not found"))),
        }
    }

    fn claimable_for(&self, host_type: &str) -> impl Iterator<Item = (&InstanceId, u64)> {
        self.instances
            .iter()
            .filter(move |(_, s)| s.record.definition.name == host_type)
            .filter_map(|(id, s)| s.claimable_at().map(|at| (id, at)))
    }
}

/// In-memory provider for tests and single-process hosts.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
    changed: Notify,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn instance_count(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    pub async fn owner_count(&self) -> usize {
        self.state.lock().await.owners.len()
    }

    /// Expire every registered owner (test utility).
    pub async fn expire_owners(&self) {
        let mut g = self.state.lock().await;
        for row in g.owners.values_mut() {
            row.expires_at_ms = 0;
        }
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn create_owner(&self, host_type: &str, lease: Duration) -> Result<OwnerId, ProviderError> {
        let owner = uuid::Uuid::new_v4();
        self.state.lock().await.owners.insert(
            owner,
            OwnerRow {
                host_type: host_type.to_string(),
                expires_at_ms: now_millis() + lease.as_millis() as u64,
            },
        );
        Ok(owner)
    }

    async fn delete_owner(&self, owner: OwnerId) -> Result<(), ProviderError> {
        self.state.lock().await.owners.remove(&owner);
        Ok(())
    }

    async fn wait_for_runnable(&self, owner: OwnerId, timeout: Duration) -> Result<bool, ProviderError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before inspecting state so a write in between is not missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due_ms = {
                let g = self.state.lock().await;
                let host_type = g.host_type(owner, "wait_for_runnable")?;
                let now = now_millis();
                let mut next: Option<u64> = None;
                for (_, at) in g.claimable_for(&host_type) {
                    if at <= now {
                        return Ok(true);
                    }
                    next = Some(next.map_or(at, |n| n.min(at)));
                }
                next
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let wake = match next_due_ms {
                Some(at) => deadline.min(now + Duration::from_millis(at.saturating_sub(now_millis()))),
                None => deadline,
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn claim_runnable(&self, owner: OwnerId, lock_for: Duration) -> Result<Option<InstanceRecord>, ProviderError> {
        let mut g = self.state.lock().await;
        let host_type = g.host_type(owner, "claim_runnable")?;
        let now = now_millis();
        let candidate = g
            .claimable_for(&host_type)
            .filter(|(_, at)| *at <= now)
            .min_by_key(|(_, at)| *at)
            .map(|(id, _)| *id);
        let Some(id) = candidate else {
            return Ok(None);
        };
        let Some(stored) = g.instances.get_mut(&id) else {
            return Ok(None);
        };
        stored.claimed_until_ms = Some(now + lock_for.as_millis() as u64);
        Ok(Some(stored.record.clone()))
    }

    async fn create_instance(&self, record: &InstanceRecord) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if g.instances.contains_key(&record.instance_id) {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {}", record.instance_id),
            ));
        }
        g.instances.insert(
            record.instance_id,
            StoredInstance {
                record: record.clone(),
                claimed_until_ms: None,
            },
        );
        drop(g);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn read_instance(&self, instance_id: InstanceId) -> Result<Option<InstanceRecord>, ProviderError> {
        Ok(self.state.lock().await.instances.get(&instance_id).map(|s| s.record.clone()))
    }

    async fn write_instance(&self, record: &InstanceRecord, expected_version: u64) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let stored = g
            .instances
            .get_mut(&record.instance_id)
            .ok_or_else(|| ProviderError::not_found("write_instance", format!("instance not found: {}", record.instance_id)))?;
        if stored.record.version != expected_version {
            return Err(ProviderError::version_conflict(
                "write_instance",
                format!("expected version {expected_version}, found {}", stored.record.version),
            ));
        }
        stored.record = record.clone();
        stored.claimed_until_ms = None;
        drop(g);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn delete_instance(&self, instance_id: InstanceId, expected_version: u64) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let stored = g
            .instances
            .get(&instance_id)
            .ok_or_else(|| ProviderError::not_found("delete_instance", format!("instance not found: {instance_id}")))?;
        if stored.record.version != expected_version {
            return Err(ProviderError::version_conflict(
                "delete_instance",
                format!("expected version {expected_version}, found {}", stored.record.version),
            ));
        }
        g.instances.remove(&instance_id);
        Ok(())
    }
}
