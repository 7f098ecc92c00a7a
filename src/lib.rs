//! Durable, message-driven host for long-lived workflow instances.
//!
//! A workflow instance is created when a start message arrives, runs until it
//! has nothing to do, and is then checkpointed to an instance store together
//! with the set of message types it is waiting for. A later message carrying
//! a correlation token (`"{instance_id}|{routing_label}"`) loads the instance
//! and resumes it. Instances waiting on a durable delay are picked up by a
//! background recovery loop once the delay is due.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use durohost::bus::{InMemoryBus, Message, Publisher};
//! use durohost::providers::in_memory::InMemoryProvider;
//! use durohost::runtime::catalog::{DefinitionCatalog, ProcessDefinition, Step};
//! use durohost::runtime::{Orchestrator, OrchestratorOptions};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct StartGreeting { name: String }
//! #[derive(Serialize, Deserialize)]
//! struct GreetingReply { text: String }
//! #[derive(Serialize, Deserialize)]
//! struct Greeting { name: String }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let greeter = ProcessDefinition::builder("Greeter", "demo", "1.0.0")
//!     .on_start("StartGreeting", |_ctx, input: StartGreeting| async move {
//!         Step::await_message("GreetingReply", &Greeting { name: input.name })
//!     })
//!     .on_resume("GreetingReply", |_ctx, _state: Greeting, _reply: GreetingReply| async move {
//!         Ok(Step::Complete)
//!     })
//!     .build()?;
//! let catalog = DefinitionCatalog::builder().register(greeter).build()?;
//!
//! let bus = InMemoryBus::new();
//! let orchestrator = Orchestrator::builder("Greeter", catalog)
//!     .provider(Arc::new(InMemoryProvider::new()))
//!     .bus(bus.clone())
//!     .options(OrchestratorOptions::default())
//!     .build()?;
//! orchestrator.start().await?;
//!
//! let start = Message::json("StartGreeting", &StartGreeting { name: "Alice".into() })?;
//! bus.publish(start, Some("Greeter")).await?;
//! orchestrator.stop(std::time::Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod bus;
pub mod correlation;
pub mod error;
pub mod providers;
pub mod runtime;

pub use correlation::{CORRELATION_HEADER, CorrelationToken};
pub use error::{BusError, ExecutionFailureKind, OrchestratorError};

/// Globally unique identifier of a workflow instance.
pub type InstanceId = uuid::Uuid;

/// Reserved blocking point recorded while an instance waits on a durable delay.
pub const TIMER_BOOKMARK: &str = "$durable-delay";

/// Identity of an immutable process definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefinitionIdentity {
    pub name: String,
    pub namespace: String,
    pub version: Version,
}

impl DefinitionIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            version,
        }
    }
}

impl fmt::Display for DefinitionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}@{}", self.name, self.version)
        } else {
            write!(f, "{}.{}@{}", self.namespace, self.name, self.version)
        }
    }
}

/// Lifecycle status of an instance.
///
/// ```text
/// Created -> Running -> Idle -> Running -> ... -> Completed | Faulted | Aborted | Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Created,
    Running,
    Idle,
    Completed,
    Faulted,
    Aborted,
    Canceled,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Faulted | Self::Aborted | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Idle => "Idle",
            Self::Completed => "Completed",
            Self::Faulted => "Faulted",
            Self::Aborted => "Aborted",
            Self::Canceled => "Canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Created" => Self::Created,
            "Running" => Self::Running,
            "Idle" => Self::Idle,
            "Completed" => Self::Completed,
            "Faulted" => Self::Faulted,
            "Aborted" => Self::Aborted,
            "Canceled" => Self::Canceled,
            _ => return None,
        })
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of one workflow instance.
///
/// `state` is owned by the executor and opaque to everything else. `version`
/// increases by one on every successful checkpoint and is compared on write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub definition: DefinitionIdentity,
    pub status: InstanceStatus,
    pub blocking_points: BTreeSet<String>,
    pub state: Option<Vec<u8>>,
    pub version: u64,
    /// Millis since epoch at which a durable delay becomes due.
    pub runnable_at_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl InstanceRecord {
    /// Fresh record for a newly minted instance.
    pub fn new(definition: DefinitionIdentity) -> Self {
        let now = now_millis();
        Self {
            instance_id: uuid::Uuid::new_v4(),
            definition,
            status: InstanceStatus::Created,
            blocking_points: BTreeSet::new(),
            state: None,
            version: 0,
            runnable_at_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn is_waiting_on(&self, input_type: &str) -> bool {
        self.blocking_points.contains(input_type)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
