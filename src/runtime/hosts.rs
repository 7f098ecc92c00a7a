use super::Orchestrator;
use crate::OrchestratorError;
use std::sync::Arc;
use std::time::Duration;

/// Explicit collection of the orchestrators one process hosts.
///
/// Owned by whatever manages process lifetime; nothing is registered implicitly.
#[derive(Default)]
pub struct HostRegistry {
    hosts: Vec<Arc<Orchestrator>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// `Definition` if an orchestrator for the same definition is already registered.
    pub fn register(&mut self, orchestrator: Arc<Orchestrator>) -> Result<(), OrchestratorError> {
        if self.find(orchestrator.definition_name()).is_some() {
            return Err(OrchestratorError::Definition(format!(
                "an orchestrator for {} is already registered",
                orchestrator.definition_name()
            )));
        }
        tracing::debug!(
            target: "durohost::registry",
            definition = %orchestrator.definition_name(),
            "Orchestrator registered"
        );
        self.hosts.push(orchestrator);
        Ok(())
    }

    pub fn hosts(&self) -> &[Arc<Orchestrator>] {
        &self.hosts
    }

    pub fn find(&self, definition_name: &str) -> Option<&Arc<Orchestrator>> {
        self.hosts.iter().find(|h| h.definition_name() == definition_name)
    }

    /// Start every host in registration order, stopping at the first failure.
    pub async fn start_all(&self) -> Result<(), OrchestratorError> {
        for host in &self.hosts {
            host.start().await?;
        }
        Ok(())
    }

    /// Stop every host concurrently, each with the same drain timeout.
    pub async fn stop_all(&self, drain_timeout: Duration) {
        futures::future::join_all(self.hosts.iter().map(|h| h.stop(drain_timeout))).await;
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
