//! Structured logging setup, lifecycle events and host metrics.

use crate::{DefinitionIdentity, InstanceId, InstanceStatus};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact format: timestamp level target fields message
    #[default]
    Compact,
}

/// Logging configuration.
///
/// ```rust,no_run
/// # use durohost::runtime::observability::{LoggingConfig, LogFormat, init_logging};
/// let config = LoggingConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
/// };
/// init_logging(&config).ok();
/// ```
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_format: LogFormat,
    /// Level for this crate's targets (e.g., "info", "debug")
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,durohost={level}")
}

/// Install a global tracing subscriber. `RUST_LOG` overrides the configured level.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), String> {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    Started,
    Resumed,
    Idle,
    Completed,
    Canceled,
    Faulted,
    Aborted,
}

/// One state transition of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub instance_id: InstanceId,
    pub definition: DefinitionIdentity,
    pub status: InstanceStatus,
    pub blocking_points: BTreeSet<String>,
    /// Resume input type for `Resumed`, cause for `Faulted`/`Aborted`.
    pub detail: Option<String>,
}

/// Receives every lifecycle transition. Called inline; keep it cheap.
pub trait LifecycleObserver: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

/// Logs transitions under the `durohost::runtime` target.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn on_event(&self, e: &LifecycleEvent) {
        let definition = &e.definition.name;
        let version = e.definition.version.to_string();
        match e.kind {
            LifecycleKind::Started => tracing::info!(
                target: "durohost::runtime",
                instance_id = %e.instance_id,
                definition = %definition,
                version = %version,
                "Instance started"
            ),
            LifecycleKind::Resumed => tracing::info!(
                target: "durohost::runtime",
                instance_id = %e.instance_id,
                definition = %definition,
                input_type = e.detail.as_deref().unwrap_or_default(),
                "Instance resumed"
            ),
            LifecycleKind::Idle => tracing::info!(
                target: "durohost::runtime",
                instance_id = %e.instance_id,
                definition = %definition,
                blocking_points = ?e.blocking_points,
                "Instance idle"
            ),
            LifecycleKind::Completed => tracing::info!(
                target: "durohost::runtime",
                instance_id = %e.instance_id,
                definition = %definition,
                "Instance completed"
            ),
            LifecycleKind::Canceled => tracing::info!(
                target: "durohost::runtime",
                instance_id = %e.instance_id,
                definition = %definition,
                "Instance canceled"
            ),
            LifecycleKind::Faulted => tracing::warn!(
                target: "durohost::runtime",
                instance_id = %e.instance_id,
                definition = %definition,
                error = e.detail.as_deref().unwrap_or_default(),
                "Instance faulted"
            ),
            LifecycleKind::Aborted => tracing::error!(
                target: "durohost::runtime",
                instance_id = %e.instance_id,
                definition = %definition,
                error = e.detail.as_deref().unwrap_or_default(),
                "Instance aborted"
            ),
        }
    }
}

/// Snapshot of host counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_consumed: u64,
    pub started: u64,
    pub resumed: u64,
    pub idle: u64,
    pub completed: u64,
    pub canceled: u64,
    pub faulted: u64,
    pub aborted: u64,
    pub execution_millis: u64,
}

/// Atomic counters, fed as a [`LifecycleObserver`] plus explicit calls from the orchestrator.
#[derive(Debug, Default)]
pub struct HostMetrics {
    messages_consumed: AtomicU64,
    started: AtomicU64,
    resumed: AtomicU64,
    idle: AtomicU64,
    completed: AtomicU64,
    canceled: AtomicU64,
    faulted: AtomicU64,
    aborted: AtomicU64,
    execution_millis: AtomicU64,
}

impl HostMetrics {
    pub fn record_message_consumed(&self) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution(&self, elapsed: Duration) {
        self.execution_millis
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            execution_millis: self.execution_millis.load(Ordering::Relaxed),
        }
    }
}

impl LifecycleObserver for HostMetrics {
    fn on_event(&self, event: &LifecycleEvent) {
        let counter = match event.kind {
            LifecycleKind::Started => &self.started,
            LifecycleKind::Resumed => &self.resumed,
            LifecycleKind::Idle => &self.idle,
            LifecycleKind::Completed => &self.completed,
            LifecycleKind::Canceled => &self.canceled,
            LifecycleKind::Faulted => &self.faulted,
            LifecycleKind::Aborted => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    fn event(kind: LifecycleKind) -> LifecycleEvent {
        LifecycleEvent {
            kind,
            instance_id: uuid::Uuid::new_v4(),
            definition: DefinitionIdentity::new("Greeter", "demo", Version::new(1, 0, 0)),
            status: InstanceStatus::Running,
            blocking_points: BTreeSet::new(),
            detail: None,
        }
    }

    #[test]
    fn metrics_count_lifecycle_events() {
        let m = HostMetrics::default();
        m.on_event(&event(LifecycleKind::Started));
        m.on_event(&event(LifecycleKind::Idle));
        m.on_event(&event(LifecycleKind::Resumed));
        m.on_event(&event(LifecycleKind::Completed));
        m.record_message_consumed();
        m.record_execution(Duration::from_millis(12));

        let s = m.snapshot();
        assert_eq!(s.started, 1);
        assert_eq!(s.idle, 1);
        assert_eq!(s.resumed, 1);
        assert_eq!(s.completed, 1);
        assert_eq!(s.faulted, 0);
        assert_eq!(s.messages_consumed, 1);
        assert_eq!(s.execution_millis, 12);
    }

    #[test]
    fn default_filter_scopes_crate() {
        assert_eq!(default_filter_expression("debug"), "warn,durohost=debug");
    }
}
