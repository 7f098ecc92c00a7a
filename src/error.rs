//! Error taxonomy surfaced at the dispatch boundary.

use crate::InstanceId;
use crate::bus::Delivery;
use crate::providers::error::{ProviderError, ProviderErrorKind};
use std::collections::BTreeSet;

/// Why an execution did not reach a normal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailureKind {
    /// Business fault raised by the process logic.
    Faulted,
    /// Infrastructure failure distinct from a business fault (panic, undecodable state).
    Aborted,
}

impl std::fmt::Display for ExecutionFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Faulted => f.write_str("faulted"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Errors raised by the orchestrator and its components.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("routing label {label:?} is empty or contains the correlation separator '|'")]
    Encoding { label: String },

    #[error("malformed correlation token {token:?}: {reason}")]
    MalformedCorrelation { token: String, reason: String },

    #[error("instance {instance_id} not found")]
    InstanceNotFound { instance_id: InstanceId },

    #[error("instance store unavailable during {operation}: {message}")]
    StoreUnavailable { operation: String, message: String },

    #[error("version conflict on instance {instance_id}: expected version {expected_version}")]
    VersionConflict {
        instance_id: InstanceId,
        expected_version: u64,
    },

    #[error("instance {instance_id} is not waiting on {input_type:?} (blocking points: {blocking_points:?})")]
    UnexpectedInput {
        instance_id: InstanceId,
        input_type: String,
        blocking_points: BTreeSet<String>,
    },

    #[error("instance {instance_id} {kind}: {cause}")]
    WorkflowExecution {
        instance_id: InstanceId,
        kind: ExecutionFailureKind,
        cause: String,
    },

    #[error("message type {type_tag:?} is not declared by definition {definition:?}")]
    UnroutableMessage { type_tag: String, definition: String },

    #[error("invalid definition: {0}")]
    Definition(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("orchestrator {definition:?} is stopping")]
    ShuttingDown { definition: String },
}

impl OrchestratorError {
    /// How the inbound message that produced this error should be settled.
    ///
    /// Transient store failures and execution failures are redelivered; everything
    /// else can never succeed on redelivery and is rejected.
    pub fn delivery(&self) -> Delivery {
        match self {
            Self::StoreUnavailable { .. }
            | Self::WorkflowExecution { .. }
            | Self::Bus(_)
            | Self::ShuttingDown { .. } => Delivery::Requeue,
            Self::Encoding { .. }
            | Self::MalformedCorrelation { .. }
            | Self::InstanceNotFound { .. }
            | Self::VersionConflict { .. }
            | Self::UnexpectedInput { .. }
            | Self::UnroutableMessage { .. }
            | Self::Definition(_) => Delivery::Reject,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.delivery() == Delivery::Requeue
    }

    /// Map an engine error for `instance_id` onto the dispatch taxonomy.
    pub(crate) fn from_provider(err: ProviderError, instance_id: InstanceId, expected_version: u64) -> Self {
        match err.kind {
            ProviderErrorKind::NotFound => Self::InstanceNotFound { instance_id },
            ProviderErrorKind::VersionConflict => Self::VersionConflict {
                instance_id,
                expected_version,
            },
            _ => Self::store_unavailable(err),
        }
    }

    pub(crate) fn store_unavailable(err: ProviderError) -> Self {
        Self::StoreUnavailable {
            operation: err.operation,
            message: err.message,
        }
    }
}

/// Failure reported by a bus collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bus {operation} failed: {message}")]
pub struct BusError {
    pub operation: String,
    pub message: String,
}

impl BusError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn poison_errors_are_rejected() {
        let id = Uuid::new_v4();
        let rejected = [
            OrchestratorError::Encoding { label: "a|b".into() },
            OrchestratorError::MalformedCorrelation {
                token: "x".into(),
                reason: "bad".into(),
            },
            OrchestratorError::InstanceNotFound { instance_id: id },
            OrchestratorError::VersionConflict {
                instance_id: id,
                expected_version: 3,
            },
            OrchestratorError::UnexpectedInput {
                instance_id: id,
                input_type: "Reply".into(),
                blocking_points: BTreeSet::new(),
            },
        ];
        for e in rejected {
            assert_eq!(e.delivery(), Delivery::Reject, "{e}");
            assert!(!e.is_retryable());
        }
    }

    #[test]
    fn transient_and_execution_errors_are_requeued() {
        let id = Uuid::new_v4();
        let store = OrchestratorError::StoreUnavailable {
            operation: "read_instance".into(),
            message: "database is locked".into(),
        };
        let faulted = OrchestratorError::WorkflowExecution {
            instance_id: id,
            kind: ExecutionFailureKind::Faulted,
            cause: "boom".into(),
        };
        let aborted = OrchestratorError::WorkflowExecution {
            instance_id: id,
            kind: ExecutionFailureKind::Aborted,
            cause: "panic".into(),
        };
        assert_eq!(store.delivery(), Delivery::Requeue);
        assert_eq!(faulted.delivery(), Delivery::Requeue);
        assert_eq!(aborted.delivery(), Delivery::Requeue);
        let stopping = OrchestratorError::ShuttingDown {
            definition: "Greeter".into(),
        };
        assert_eq!(stopping.delivery(), Delivery::Requeue);
    }

    #[test]
    fn provider_errors_map_by_kind() {
        let id = Uuid::new_v4();
        let nf = OrchestratorError::from_provider(ProviderError::not_found("read_instance", "gone"), id, 0);
        assert_eq!(nf, OrchestratorError::InstanceNotFound { instance_id: id });

        let vc = OrchestratorError::from_provider(ProviderError::version_conflict("write_instance", "stale"), id, 4);
        assert_eq!(
            vc,
            OrchestratorError::VersionConflict {
                instance_id: id,
                expected_version: 4
            }
        );

        let busy = OrchestratorError::from_provider(ProviderError::retryable("write_instance", "busy"), id, 4);
        assert!(matches!(busy, OrchestratorError::StoreUnavailable { .. }));
    }
}
