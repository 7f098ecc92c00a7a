//! Provider wrapper that injects engine faults for testing retry and
//! crash-and-continue behavior.

#![allow(dead_code)]

use async_trait::async_trait;
use durohost::providers::in_memory::InMemoryProvider;
use durohost::providers::{OwnerId, Provider, ProviderError};
use durohost::{InstanceId, InstanceRecord};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Wraps an [`InMemoryProvider`], failing selected operations on demand and
/// counting the calls that reach it.
pub struct FlakyProvider {
    inner: Arc<InMemoryProvider>,
    /// Remaining `read_instance` calls that fail with a retryable error.
    failing_reads: AtomicU32,
    /// Remaining `write_instance` calls that fail with a retryable error.
    failing_writes: AtomicU32,
    /// Next `wait_for_runnable` panics, then the flag clears.
    panic_next_wait: AtomicBool,
    read_calls: AtomicU32,
    create_owner_calls: AtomicU32,
    wait_calls: AtomicU32,
}

impl FlakyProvider {
    pub fn new(inner: Arc<InMemoryProvider>) -> Self {
        Self {
            inner,
            failing_reads: AtomicU32::new(0),
            failing_writes: AtomicU32::new(0),
            panic_next_wait: AtomicBool::new(false),
            read_calls: AtomicU32::new(0),
            create_owner_calls: AtomicU32::new(0),
            wait_calls: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<InMemoryProvider> {
        &self.inner
    }

    pub fn fail_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn panic_on_next_wait(&self) {
        self.panic_next_wait.store(true, Ordering::SeqCst);
    }

    pub fn read_calls(&self) -> u32 {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn create_owner_calls(&self) -> u32 {
        self.create_owner_calls.load(Ordering::SeqCst)
    }

    pub fn wait_calls(&self) -> u32 {
        self.wait_calls.load(Ordering::SeqCst)
    }

    /// Consume one pending failure from `counter`, if any.
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Provider for FlakyProvider {
    async fn create_owner(&self, host_type: &str, lease: Duration) -> Result<OwnerId, ProviderError> {
        self.create_owner_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.create_owner(host_type, lease).await
    }

    async fn delete_owner(&self, owner: OwnerId) -> Result<(), ProviderError> {
        self.inner.delete_owner(owner).await
    }

    async fn wait_for_runnable(&self, owner: OwnerId, timeout: Duration) -> Result<bool, ProviderError> {
        self.wait_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_next_wait.swap(false, Ordering::SeqCst) {
            panic!("injected wait_for_runnable panic");
        }
        self.inner.wait_for_runnable(owner, timeout).await
    }

    async fn claim_runnable(&self, owner: OwnerId, lock_for: Duration) -> Result<Option<InstanceRecord>, ProviderError> {
        self.inner.claim_runnable(owner, lock_for).await
    }

    async fn create_instance(&self, record: &InstanceRecord) -> Result<(), ProviderError> {
        self.inner.create_instance(record).await
    }

    async fn read_instance(&self, instance_id: InstanceId) -> Result<Option<InstanceRecord>, ProviderError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_reads) {
            return Err(ProviderError::retryable("read_instance", "injected: database is locked"));
        }
        self.inner.read_instance(instance_id).await
    }

    async fn write_instance(&self, record: &InstanceRecord, expected_version: u64) -> Result<(), ProviderError> {
        if Self::take_failure(&self.failing_writes) {
            return Err(ProviderError::retryable("write_instance", "injected: connection reset"));
        }
        self.inner.write_instance(record, expected_version).await
    }

    async fn delete_instance(&self, instance_id: InstanceId, expected_version: u64) -> Result<(), ProviderError> {
        self.inner.delete_instance(instance_id, expected_version).await
    }
}
