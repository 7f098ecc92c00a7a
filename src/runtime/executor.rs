//! Runs one instance to its next suspension or terminal state.

use super::catalog::{DefinitionCatalog, ProcessDefinition, Step, StepError, StepHandler};
use super::context::{ExecutionScope, ProcessContext, Services};
use super::observability::{HostMetrics, LifecycleEvent, LifecycleKind, LifecycleObserver};
use crate::bus::{Message, Publisher};
use crate::providers::{CheckpointUpdate, InstanceStore};
use crate::{ExecutionFailureKind, InstanceRecord, InstanceStatus, OrchestratorError, TIMER_BOOKMARK, now_millis};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// What drives a run.
#[derive(Debug, Clone)]
pub enum ExecutionInput {
    Start(Message),
    Resume(Message),
    /// A durable delay came due; no message involved.
    TimerElapsed,
}

impl ExecutionInput {
    /// Blocking point this input satisfies.
    pub fn input_type(&self) -> &str {
        match self {
            Self::Start(m) | Self::Resume(m) => &m.type_tag,
            Self::TimerElapsed => TIMER_BOOKMARK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Idle {
        blocking_points: BTreeSet<String>,
        runnable_at_ms: Option<u64>,
    },
    Completed,
    Canceled,
    Faulted { cause: String },
    Aborted { cause: String },
}

impl ExecutionOutcome {
    pub fn status(&self) -> InstanceStatus {
        match self {
            Self::Idle { .. } => InstanceStatus::Idle,
            Self::Completed => InstanceStatus::Completed,
            Self::Canceled => InstanceStatus::Canceled,
            Self::Faulted { .. } => InstanceStatus::Faulted,
            Self::Aborted { .. } => InstanceStatus::Aborted,
        }
    }

    fn kind(&self) -> LifecycleKind {
        match self {
            Self::Idle { .. } => LifecycleKind::Idle,
            Self::Completed => LifecycleKind::Completed,
            Self::Canceled => LifecycleKind::Canceled,
            Self::Faulted { .. } => LifecycleKind::Faulted,
            Self::Aborted { .. } => LifecycleKind::Aborted,
        }
    }

    /// The `WorkflowExecution` error for failed outcomes.
    pub fn into_error(self, instance_id: crate::InstanceId) -> Result<Self, OrchestratorError> {
        match self {
            Self::Faulted { cause } => Err(OrchestratorError::WorkflowExecution {
                instance_id,
                kind: ExecutionFailureKind::Faulted,
                cause,
            }),
            Self::Aborted { cause } => Err(OrchestratorError::WorkflowExecution {
                instance_id,
                kind: ExecutionFailureKind::Aborted,
                cause,
            }),
            other => Ok(other),
        }
    }
}

/// Executes process logic and commits the resulting transition.
pub struct InstanceExecutor {
    catalog: DefinitionCatalog,
    store: Arc<InstanceStore>,
    publisher: Option<Arc<dyn Publisher>>,
    services: Arc<Services>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    metrics: Arc<HostMetrics>,
}

impl InstanceExecutor {
    pub fn new(
        catalog: DefinitionCatalog,
        store: Arc<InstanceStore>,
        publisher: Option<Arc<dyn Publisher>>,
        services: Arc<Services>,
        observers: Vec<Arc<dyn LifecycleObserver>>,
        metrics: Arc<HostMetrics>,
    ) -> Self {
        Self {
            catalog,
            store,
            publisher,
            services,
            observers,
            metrics,
        }
    }

    fn emit(&self, kind: LifecycleKind, record: &InstanceRecord, detail: Option<String>) {
        let event = LifecycleEvent {
            kind,
            instance_id: record.instance_id,
            definition: record.definition.clone(),
            status: record.status,
            blocking_points: record.blocking_points.clone(),
            detail,
        };
        self.metrics.on_event(&event);
        for o in &self.observers {
            o.on_event(&event);
        }
    }

    /// Check `input` against the record and pick the handler that consumes it.
    fn select_handler(
        &self,
        definition: &ProcessDefinition,
        record: &InstanceRecord,
        input: &ExecutionInput,
    ) -> Result<Arc<dyn StepHandler>, OrchestratorError> {
        let unexpected = || OrchestratorError::UnexpectedInput {
            instance_id: record.instance_id,
            input_type: input.input_type().to_string(),
            blocking_points: record.blocking_points.clone(),
        };
        match input {
            ExecutionInput::Start(m) if record.status == InstanceStatus::Created && m.type_tag == definition.start_type() => {
                Ok(definition.start_handler())
            }
            ExecutionInput::Start(_) => Err(unexpected()),
            _ if record.status != InstanceStatus::Idle || !record.is_waiting_on(input.input_type()) => Err(unexpected()),
            ExecutionInput::Resume(m) => definition.resume_handler(&m.type_tag).ok_or_else(unexpected),
            ExecutionInput::TimerElapsed => definition.timer_handler().ok_or_else(unexpected),
        }
    }

    /// Turn a step into the outcome and the durable update it implies.
    fn conclude(definition: &ProcessDefinition, record: &InstanceRecord, step: Step) -> (ExecutionOutcome, CheckpointUpdate) {
        match step {
            Step::Suspend { awaiting, state, delay } => {
                if let Some(undeclared) = awaiting.iter().find(|t| definition.resume_handler(t).is_none()) {
                    return Self::aborted(record, format!("suspended on undeclared input {undeclared:?}"));
                }
                if delay.is_some() && !definition.has_timer() {
                    return Self::aborted(record, "durable delay requested without a timer handler".to_string());
                }
                let mut blocking_points = awaiting;
                if delay.is_some() {
                    blocking_points.insert(TIMER_BOOKMARK.to_string());
                }
                if blocking_points.is_empty() {
                    return Self::aborted(record, "suspended without any blocking point".to_string());
                }
                let runnable_at_ms = delay.map(|d| now_millis() + d.as_millis() as u64);
                (
                    ExecutionOutcome::Idle {
                        blocking_points: blocking_points.clone(),
                        runnable_at_ms,
                    },
                    CheckpointUpdate::idle(blocking_points, state, runnable_at_ms),
                )
            }
            Step::Complete => (
                ExecutionOutcome::Completed,
                CheckpointUpdate::terminal(InstanceStatus::Completed, record.state.clone()),
            ),
            Step::Cancel => (
                ExecutionOutcome::Canceled,
                CheckpointUpdate::terminal(InstanceStatus::Canceled, record.state.clone()),
            ),
        }
    }

    fn aborted(record: &InstanceRecord, cause: String) -> (ExecutionOutcome, CheckpointUpdate) {
        (
            ExecutionOutcome::Aborted { cause },
            CheckpointUpdate::terminal(InstanceStatus::Aborted, record.state.clone()),
        )
    }

    /// Run `record` with `input` and persist the result before returning.
    ///
    /// Faulted and Aborted runs are reported as outcomes, not errors; errors
    /// mean nothing was committed.
    ///
    /// # Errors
    ///
    /// `UnexpectedInput` when the record is not waiting on `input`;
    /// `VersionConflict` or `StoreUnavailable` from the checkpoint;
    /// `WorkflowExecution` (aborted) when the recorded definition version is not registered.
    pub async fn run(&self, mut record: InstanceRecord, input: ExecutionInput) -> Result<ExecutionOutcome, OrchestratorError> {
        let Some(definition) = self.catalog.exact(&record.definition) else {
            return Err(OrchestratorError::WorkflowExecution {
                instance_id: record.instance_id,
                kind: ExecutionFailureKind::Aborted,
                cause: format!("definition {} is not registered", record.definition),
            });
        };
        let handler = self.select_handler(&definition, &record, &input)?;

        record.status = InstanceStatus::Running;
        match &input {
            ExecutionInput::Start(_) => self.emit(LifecycleKind::Started, &record, None),
            _ => self.emit(LifecycleKind::Resumed, &record, Some(input.input_type().to_string())),
        }

        let scope = Arc::new(ExecutionScope::new(self.services.clone()));
        let ctx = ProcessContext::new(record.instance_id, record.definition.clone(), scope.clone());
        let payload = match input {
            ExecutionInput::Start(m) | ExecutionInput::Resume(m) => m.payload,
            ExecutionInput::TimerElapsed => Vec::new(),
        };

        let started = Instant::now();
        let result = AssertUnwindSafe(handler.invoke(ctx, record.state.clone(), payload))
            .catch_unwind()
            .await;
        self.metrics.record_execution(started.elapsed());

        let (outcome, update) = match result {
            Ok(Ok(step)) => Self::conclude(&definition, &record, step),
            Ok(Err(StepError::Fault(cause))) => (
                ExecutionOutcome::Faulted { cause },
                CheckpointUpdate::terminal(InstanceStatus::Faulted, record.state.clone()),
            ),
            Ok(Err(StepError::Abort(cause))) => Self::aborted(&record, cause),
            Err(panic) => Self::aborted(&record, format!("process logic panicked: {}", panic_message(&panic))),
        };

        let committed = match self.store.checkpoint(&record, update).await {
            Ok(c) => c,
            Err(e) => {
                if matches!(e, OrchestratorError::VersionConflict { .. }) {
                    tracing::error!(
                        target: "durohost::runtime",
                        instance_id = %record.instance_id,
                        definition = %record.definition.name,
                        version = record.version,
                        "Instance was advanced by another execution; discarding this run"
                    );
                }
                return Err(e);
            }
        };

        let outbox = scope.take_outbox();
        let detail = match &outcome {
            ExecutionOutcome::Faulted { cause } | ExecutionOutcome::Aborted { cause } => {
                if !outbox.is_empty() {
                    tracing::debug!(
                        target: "durohost::runtime",
                        instance_id = %committed.instance_id,
                        dropped = outbox.len(),
                        "Discarding messages published by a failed step"
                    );
                }
                Some(cause.clone())
            }
            _ => {
                for (message, topic) in outbox {
                    self.send(&committed, message, topic).await;
                }
                None
            }
        };
        self.emit(outcome.kind(), &committed, detail);
        Ok(outcome)
    }

    async fn send(&self, record: &InstanceRecord, message: Message, topic: Option<String>) {
        let Some(publisher) = &self.publisher else {
            tracing::warn!(
                target: "durohost::runtime",
                instance_id = %record.instance_id,
                message_type = %message.type_tag,
                "No publisher configured; dropping outbound message"
            );
            return;
        };
        let message_type = message.type_tag.clone();
        if let Err(e) = publisher.publish(message, topic.as_deref()).await {
            tracing::error!(
                target: "durohost::runtime",
                instance_id = %record.instance_id,
                message_type = %message_type,
                error = %e,
                "Failed to publish outbound message after checkpoint"
            );
        }
    }
}

pub(super) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
