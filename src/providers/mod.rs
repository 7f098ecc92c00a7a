//! Durable instance storage.
//!
//! [`Provider`] is the raw storage engine contract: owners, records and the
//! wait/claim primitives for instances that became runnable on their own.
//! [`InstanceStore`] sits on top of it and owns the process-local concerns:
//! the owner lease, bounded retries on load, and checkpoint composition.

use crate::{DefinitionIdentity, InstanceId, InstanceRecord, InstanceStatus, OrchestratorError, now_millis};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::{ProviderError, ProviderErrorKind};

/// Identifier of an owner registered with the storage engine.
pub type OwnerId = uuid::Uuid;

/// Storage engine contract.
///
/// Records are written whole. `version` on a written record is chosen by the
/// caller; engines only compare the stored version with `expected_version`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Register an owner for instances of `host_type`, valid for `lease`.
    async fn create_owner(&self, host_type: &str, lease: Duration) -> Result<OwnerId, ProviderError>;

    /// Remove an owner. Unknown owners are not an error.
    async fn delete_owner(&self, owner: OwnerId) -> Result<(), ProviderError>;

    /// Block up to `timeout` until an instance of the owner's host type is runnable.
    ///
    /// Fails with `LeaseLost` when `owner` is unknown or expired.
    async fn wait_for_runnable(&self, owner: OwnerId, timeout: Duration) -> Result<bool, ProviderError>;

    /// Lock one runnable instance for `lock_for` and return it.
    async fn claim_runnable(&self, owner: OwnerId, lock_for: Duration) -> Result<Option<InstanceRecord>, ProviderError>;

    /// Insert a new record. Fails if the id already exists.
    async fn create_instance(&self, record: &InstanceRecord) -> Result<(), ProviderError>;

    async fn read_instance(&self, instance_id: InstanceId) -> Result<Option<InstanceRecord>, ProviderError>;

    /// Replace the stored record if its version equals `expected_version`, releasing any claim.
    ///
    /// Fails with `NotFound` or `VersionConflict`.
    async fn write_instance(&self, record: &InstanceRecord, expected_version: u64) -> Result<(), ProviderError>;

    /// Remove the record if its version equals `expected_version`.
    async fn delete_instance(&self, instance_id: InstanceId, expected_version: u64) -> Result<(), ProviderError>;
}

/// What happens to a record once it reaches a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionAction {
    /// Delete the record in the same step that would have written the terminal status.
    #[default]
    DeleteAll,
    /// Keep the terminal record for inspection.
    Retain,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): `base * 2^(attempt - 1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << shift)
    }
}

/// Tuning for [`InstanceStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub owner_create_timeout: Duration,
    pub owner_release_timeout: Duration,
    /// How long an owner stays valid in the engine.
    pub owner_lease_duration: Duration,
    /// How long a claimed runnable instance stays locked to this owner.
    pub instance_claim_duration: Duration,
    pub load_retry: RetryPolicy,
    pub completion_action: CompletionAction,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            owner_create_timeout: Duration::from_secs(30),
            owner_release_timeout: Duration::from_secs(10),
            owner_lease_duration: Duration::from_secs(300),
            instance_claim_duration: Duration::from_secs(60),
            load_retry: RetryPolicy::default(),
            completion_action: CompletionAction::DeleteAll,
        }
    }
}

/// This process's claim on the store for one host type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerLease {
    pub owner_id: OwnerId,
    pub host_type: String,
    pub acquired_at: Instant,
    /// Locally treated as expired from here on, ahead of the engine's own expiry.
    pub renew_after: Instant,
}

impl OwnerLease {
    pub fn is_valid(&self) -> bool {
        Instant::now() < self.renew_after
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Unleased,
    Leased,
    Expired,
}

/// Local validity window for a lease of `lease`: long leases keep a 5s buffer, short ones renew at half-life.
fn renewal_window(lease: Duration) -> Duration {
    if lease >= Duration::from_secs(15) {
        lease.saturating_sub(Duration::from_secs(5))
    } else {
        lease / 2
    }
}

/// A runnable instance claimed through [`InstanceStore::try_claim_runnable`].
#[derive(Debug, Clone)]
pub struct RunnableInstance {
    pub record: InstanceRecord,
    pub owner: OwnerId,
}

/// New durable values written by a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointUpdate {
    pub status: InstanceStatus,
    pub blocking_points: BTreeSet<String>,
    pub state: Option<Vec<u8>>,
    pub runnable_at_ms: Option<u64>,
}

impl CheckpointUpdate {
    pub fn idle(blocking_points: BTreeSet<String>, state: Vec<u8>, runnable_at_ms: Option<u64>) -> Self {
        Self {
            status: InstanceStatus::Idle,
            blocking_points,
            state: Some(state),
            runnable_at_ms,
        }
    }

    /// Terminal transition. Open blocking points and timers are dropped.
    pub fn terminal(status: InstanceStatus, state: Option<Vec<u8>>) -> Self {
        Self {
            status,
            blocking_points: BTreeSet::new(),
            state,
            runnable_at_ms: None,
        }
    }
}

/// Process-local face of the instance store.
pub struct InstanceStore {
    provider: Arc<dyn Provider>,
    options: StoreOptions,
    lease: std::sync::Mutex<Option<OwnerLease>>,
    host_type: std::sync::Mutex<Option<String>>,
    // Serializes owner (re)creation; readers go through `lease` only.
    renewal: tokio::sync::Mutex<()>,
}

impl InstanceStore {
    pub fn new(provider: Arc<dyn Provider>, options: StoreOptions) -> Self {
        Self {
            provider,
            options,
            lease: std::sync::Mutex::new(None),
            host_type: std::sync::Mutex::new(None),
            renewal: tokio::sync::Mutex::new(()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn lease(&self) -> Option<OwnerLease> {
        self.lease.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn lease_state(&self) -> LeaseState {
        match self.lease() {
            None => LeaseState::Unleased,
            Some(l) if l.is_valid() => LeaseState::Leased,
            Some(_) => LeaseState::Expired,
        }
    }

    fn valid_lease(&self) -> Option<OwnerLease> {
        self.lease().filter(OwnerLease::is_valid)
    }

    fn invalidate_lease(&self, owner: OwnerId) {
        let mut guard = self.lease.lock().unwrap_or_else(|p| p.into_inner());
        if guard.as_ref().is_some_and(|l| l.owner_id == owner) {
            *guard = None;
        }
    }

    /// Make sure a valid owner lease exists for `definition`'s host type.
    ///
    /// Idempotent: concurrent and repeated calls create at most one owner while
    /// the current lease stays valid.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` when the create-owner command fails or times out.
    pub async fn ensure_owner(&self, definition: &DefinitionIdentity) -> Result<OwnerId, OrchestratorError> {
        *self.host_type.lock().unwrap_or_else(|p| p.into_inner()) = Some(definition.name.clone());
        self.acquire_owner(&definition.name).await
    }

    async fn acquire_owner(&self, host_type: &str) -> Result<OwnerId, OrchestratorError> {
        if let Some(lease) = self.valid_lease()
            && lease.host_type == host_type
        {
            return Ok(lease.owner_id);
        }

        let _creating = self.renewal.lock().await;
        if let Some(lease) = self.valid_lease()
            && lease.host_type == host_type
        {
            return Ok(lease.owner_id);
        }

        let timeout = self.options.owner_create_timeout;
        let lease_for = self.options.owner_lease_duration;
        let owner_id = match tokio::time::timeout(timeout, self.provider.create_owner(host_type, lease_for)).await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                tracing::warn!(target: "durohost::store", host_type = %host_type, error = %e, "Failed to create instance owner");
                return Err(OrchestratorError::store_unavailable(e));
            }
            Err(_) => {
                tracing::warn!(target: "durohost::store", host_type = %host_type, timeout_ms = timeout.as_millis() as u64, "Timed out creating instance owner");
                return Err(OrchestratorError::StoreUnavailable {
                    operation: "create_owner".to_string(),
                    message: format!("timed out after {timeout:?}"),
                });
            }
        };

        let now = Instant::now();
        *self.lease.lock().unwrap_or_else(|p| p.into_inner()) = Some(OwnerLease {
            owner_id,
            host_type: host_type.to_string(),
            acquired_at: now,
            renew_after: now + renewal_window(lease_for),
        });
        tracing::info!(target: "durohost::store", host_type = %host_type, owner_id = %owner_id, "Instance owner lease acquired");
        Ok(owner_id)
    }

    /// Current owner, renewing the lease if it expired.
    async fn current_owner(&self) -> Result<OwnerId, OrchestratorError> {
        if let Some(lease) = self.valid_lease() {
            return Ok(lease.owner_id);
        }
        let host_type = self.host_type.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match host_type {
            Some(h) => self.acquire_owner(&h).await,
            None => Err(OrchestratorError::StoreUnavailable {
                operation: "current_owner".to_string(),
                message: "no owner has been requested for this store".to_string(),
            }),
        }
    }

    /// Delete the owner and forget the lease. Best effort.
    pub async fn release_owner(&self) {
        let _creating = self.renewal.lock().await;
        let Some(lease) = self.lease.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            return;
        };
        let timeout = self.options.owner_release_timeout;
        match tokio::time::timeout(timeout, self.provider.delete_owner(lease.owner_id)).await {
            Ok(Ok(())) => {
                tracing::debug!(target: "durohost::store", owner_id = %lease.owner_id, "Instance owner released");
            }
            Ok(Err(e)) => {
                tracing::warn!(target: "durohost::store", owner_id = %lease.owner_id, error = %e, "Failed to release instance owner");
            }
            Err(_) => {
                tracing::warn!(target: "durohost::store", owner_id = %lease.owner_id, "Timed out releasing instance owner");
            }
        }
    }

    /// Wait up to `timeout` for a runnable instance under this owner.
    ///
    /// Never fails: lease loss, engine errors and timeouts all read as `false`.
    pub async fn wait_for_runnable(&self, timeout: Duration) -> bool {
        let owner = match self.current_owner().await {
            Ok(o) => o,
            Err(e) => {
                tracing::debug!(target: "durohost::store", error = %e, "No owner lease while waiting for runnable instances");
                // Back off so a dead store does not turn the caller into a busy loop.
                tokio::time::sleep(timeout.min(Duration::from_secs(1))).await;
                return false;
            }
        };
        match self.provider.wait_for_runnable(owner, timeout).await {
            Ok(found) => found,
            Err(e) if e.kind == ProviderErrorKind::LeaseLost => {
                tracing::info!(target: "durohost::store", owner_id = %owner, "Instance owner lease lost; will renew");
                self.invalidate_lease(owner);
                false
            }
            Err(e) => {
                tracing::debug!(target: "durohost::store", owner_id = %owner, error = %e, "Wait for runnable instance failed");
                false
            }
        }
    }

    /// Claim one runnable instance, waiting at most `timeout`.
    ///
    /// Errors are logged and reported as `None`.
    pub async fn try_claim_runnable(&self, timeout: Duration) -> Option<RunnableInstance> {
        let owner = self.current_owner().await.ok()?;
        let claim = self.provider.claim_runnable(owner, self.options.instance_claim_duration);
        match tokio::time::timeout(timeout, claim).await {
            Ok(Ok(Some(record))) => {
                tracing::debug!(target: "durohost::store", instance_id = %record.instance_id, owner_id = %owner, "Claimed runnable instance");
                Some(RunnableInstance { record, owner })
            }
            Ok(Ok(None)) | Err(_) => None,
            Ok(Err(e)) => {
                if e.kind == ProviderErrorKind::LeaseLost {
                    self.invalidate_lease(owner);
                }
                tracing::warn!(target: "durohost::store", owner_id = %owner, error = %e, "Failed to claim runnable instance");
                None
            }
        }
    }

    /// Persist a fresh `Created` record for `definition`.
    pub async fn create(&self, definition: &DefinitionIdentity) -> Result<InstanceRecord, OrchestratorError> {
        self.current_owner().await?;
        let record = InstanceRecord::new(definition.clone());
        self.provider
            .create_instance(&record)
            .await
            .map_err(OrchestratorError::store_unavailable)?;
        tracing::debug!(target: "durohost::store", instance_id = %record.instance_id, definition = %definition, "Instance created");
        Ok(record)
    }

    /// Load an instance, retrying transient engine failures with backoff.
    ///
    /// # Errors
    ///
    /// `InstanceNotFound` if absent; `StoreUnavailable` once the retry budget is spent.
    pub async fn load(&self, instance_id: InstanceId) -> Result<InstanceRecord, OrchestratorError> {
        self.current_owner().await?;
        let policy = &self.options.load_retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.provider.read_instance(instance_id).await {
                Ok(Some(record)) => return Ok(record),
                Ok(None) => return Err(OrchestratorError::InstanceNotFound { instance_id }),
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_after(attempt);
                    tracing::warn!(
                        target: "durohost::store",
                        instance_id = %instance_id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure loading instance, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        target: "durohost::store",
                        instance_id = %instance_id,
                        attempts = attempt,
                        error = %e,
                        "Failed to load instance"
                    );
                    return Err(OrchestratorError::from_provider(e, instance_id, 0));
                }
            }
        }
    }

    /// Write `update` over `record`, failing if another writer got there first.
    ///
    /// Returns the record as now stored. Terminal records are deleted instead
    /// when the completion action is [`CompletionAction::DeleteAll`].
    ///
    /// # Errors
    ///
    /// `VersionConflict` when the stored version moved on or the record is
    /// gone, `StoreUnavailable` for engine failures.
    pub async fn checkpoint(
        &self,
        record: &InstanceRecord,
        update: CheckpointUpdate,
    ) -> Result<InstanceRecord, OrchestratorError> {
        self.current_owner().await?;
        let mut next = record.clone();
        next.status = update.status;
        next.blocking_points = update.blocking_points;
        next.state = update.state;
        next.runnable_at_ms = update.runnable_at_ms;
        next.version = record.version + 1;
        next.updated_at_ms = now_millis();

        let result = if next.status.is_terminal() && self.options.completion_action == CompletionAction::DeleteAll {
            self.provider.delete_instance(record.instance_id, record.version).await
        } else {
            self.provider.write_instance(&next, record.version).await
        };
        result.map_err(|e| {
            // `record` came from `create` or `load`, so a missing row means a
            // competing execution completed and removed it.
            if e.kind == ProviderErrorKind::NotFound {
                tracing::debug!(
                    target: "durohost::store",
                    instance_id = %record.instance_id,
                    expected_version = record.version,
                    "Instance removed by another writer before checkpoint"
                );
                return OrchestratorError::VersionConflict {
                    instance_id: record.instance_id,
                    expected_version: record.version,
                };
            }
            OrchestratorError::from_provider(e, record.instance_id, record.version)
        })?;

        tracing::trace!(
            target: "durohost::store",
            instance_id = %next.instance_id,
            status = %next.status,
            version = next.version,
            "Instance checkpointed"
        );
        Ok(next)
    }

    /// Remove an instance outright.
    pub async fn delete(&self, record: &InstanceRecord) -> Result<(), OrchestratorError> {
        self.provider
            .delete_instance(record.instance_id, record.version)
            .await
            .map_err(|e| OrchestratorError::from_provider(e, record.instance_id, record.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_after(1), Duration::from_millis(250));
        assert_eq!(p.delay_after(2), Duration::from_millis(500));
        assert_eq!(p.delay_after(3), Duration::from_millis(1000));
        assert_eq!(p.delay_after(4), Duration::from_millis(2000));
    }

    #[test]
    fn renewal_window_keeps_buffer() {
        assert_eq!(renewal_window(Duration::from_secs(300)), Duration::from_secs(295));
        assert_eq!(renewal_window(Duration::from_secs(10)), Duration::from_secs(5));
    }

    #[test]
    fn terminal_update_clears_blocking_points() {
        let u = CheckpointUpdate::terminal(InstanceStatus::Completed, None);
        assert!(u.blocking_points.is_empty());
        assert_eq!(u.runnable_at_ms, None);
    }
}
