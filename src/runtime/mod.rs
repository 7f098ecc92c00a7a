//! Orchestrator host: routes inbound messages to instances, runs the recovery
//! loop and drains in-flight work on shutdown.
//!
//! One [`Orchestrator`] hosts one process definition (all of its registered
//! versions). Start inputs create instances; resume inputs carry a
//! [`CorrelationToken`](crate::CorrelationToken) naming the instance to wake.
//! Instances waiting on a durable delay are woken by the recovery loop.

use crate::bus::{Delivery, Message, MessageHandler, Publisher, Subscription, SubscriptionBinder, SubscriptionSpec};
use crate::correlation;
use crate::providers::in_memory::InMemoryProvider;
use crate::providers::{InstanceStore, Provider, StoreOptions};
use crate::{DefinitionIdentity, OrchestratorError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub mod catalog;
pub mod context;
pub mod executor;
pub mod hosts;
pub mod in_flight;
pub mod observability;
mod recovery;

pub use catalog::{DefinitionCatalog, FnStep, ProcessDefinition, ProcessDefinitionBuilder, Step, StepError, StepHandler};
pub use context::{HostCapabilities, ProcessContext, Services};
pub use executor::{ExecutionInput, ExecutionOutcome, InstanceExecutor};
pub use hosts::HostRegistry;
pub use in_flight::{InFlightCounter, InFlightGuard};
pub use observability::{
    HostMetrics, LifecycleEvent, LifecycleKind, LifecycleObserver, LogFormat, LoggingConfig, MetricsSnapshot,
    TracingObserver, init_logging,
};

/// Lets a host with a shutdown deadline know that shutdown is still progressing.
pub trait LifetimeExtension: Send + Sync {
    fn request_additional_time(&self, additional: Duration);
}

/// Ignores every request.
#[derive(Debug, Default)]
pub struct NoLifetimeExtension;

impl LifetimeExtension for NoLifetimeExtension {
    fn request_additional_time(&self, _additional: Duration) {}
}

/// Configuration for an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub store: StoreOptions,
    /// How long one recovery poll blocks waiting for a runnable instance.
    pub recovery_poll_timeout: Duration,
    /// Upper bound on a single claim attempt after a successful wait.
    pub claim_timeout: Duration,
    /// Pause before the recovery loop restarts after a panic.
    pub recovery_restart_delay: Duration,
    /// Requested from the lifetime collaborator when `stop` begins.
    pub shutdown_initial_extension: Duration,
    /// Each wait for the recovery loop to exit; the collaborator is asked for this much per round.
    pub recovery_exit_slice: Duration,
    pub recovery_exit_rounds: u32,
    pub drain_poll_interval: Duration,
    /// Requested from the lifetime collaborator on every drain round.
    pub drain_extension: Duration,
    /// Queue name for all bindings; defaults to the definition name.
    pub subscription_id: Option<String>,
    /// Topic filter for all bindings; defaults to the definition name.
    pub topic: Option<String>,
    pub prefetch: u16,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            store: StoreOptions::default(),
            recovery_poll_timeout: Duration::from_secs(30),
            claim_timeout: Duration::from_secs(1),
            recovery_restart_delay: Duration::from_secs(1),
            shutdown_initial_extension: Duration::from_secs(5),
            recovery_exit_slice: Duration::from_secs(20),
            recovery_exit_rounds: 4,
            drain_poll_interval: Duration::from_secs(2),
            drain_extension: Duration::from_secs(5),
            subscription_id: None,
            topic: None,
            prefetch: 50,
        }
    }
}

/// Builds an [`Orchestrator`] for one definition in a catalog.
pub struct OrchestratorBuilder {
    definition_name: String,
    catalog: DefinitionCatalog,
    provider: Option<Arc<dyn Provider>>,
    publisher: Option<Arc<dyn Publisher>>,
    binder: Option<Arc<dyn SubscriptionBinder>>,
    services: Services,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    lifetime: Option<Arc<dyn LifetimeExtension>>,
    options: OrchestratorOptions,
}

impl OrchestratorBuilder {
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Use one bus as both publisher and subscription binder.
    pub fn bus<B>(self, bus: B) -> Self
    where
        B: Publisher + SubscriptionBinder + Clone + 'static,
    {
        self.publisher(Arc::new(bus.clone())).binder(Arc::new(bus))
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn binder(mut self, binder: Arc<dyn SubscriptionBinder>) -> Self {
        self.binder = Some(binder);
        self
    }

    pub fn services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn lifetime(mut self, lifetime: Arc<dyn LifetimeExtension>) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    /// # Errors
    ///
    /// `Definition` when the catalog has no definition with this name.
    pub fn build(self) -> Result<Arc<Orchestrator>, OrchestratorError> {
        if !self.catalog.has(&self.definition_name) {
            return Err(OrchestratorError::Definition(format!(
                "catalog has no definition named {:?}",
                self.definition_name
            )));
        }
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(InMemoryProvider::new()) as Arc<dyn Provider>);
        let store = Arc::new(InstanceStore::new(provider, self.options.store.clone()));
        let metrics = Arc::new(HostMetrics::default());

        let mut observers: Vec<Arc<dyn LifecycleObserver>> = vec![Arc::new(TracingObserver)];
        observers.extend(self.observers);

        let executor = InstanceExecutor::new(
            self.catalog.clone(),
            store.clone(),
            self.publisher,
            Arc::new(self.services),
            observers,
            metrics.clone(),
        );

        Ok(Arc::new(Orchestrator {
            definition_name: self.definition_name,
            catalog: self.catalog,
            store,
            executor,
            binder: self.binder,
            lifetime: self.lifetime.unwrap_or_else(|| Arc::new(NoLifetimeExtension)),
            options: self.options,
            in_flight: InFlightCounter::new(),
            metrics,
            running: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            stop_signal: Notify::new(),
            lifecycle: tokio::sync::Mutex::new(()),
            subscriptions: Mutex::new(Vec::new()),
            recovery: Mutex::new(None),
        }))
    }
}

/// Hosts every instance of one process definition.
pub struct Orchestrator {
    definition_name: String,
    catalog: DefinitionCatalog,
    store: Arc<InstanceStore>,
    executor: InstanceExecutor,
    binder: Option<Arc<dyn SubscriptionBinder>>,
    lifetime: Arc<dyn LifetimeExtension>,
    options: OrchestratorOptions,
    in_flight: InFlightCounter,
    metrics: Arc<HostMetrics>,
    running: AtomicBool,
    accepting: AtomicBool,
    stop_signal: Notify,
    // Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
    subscriptions: Mutex<Vec<Box<dyn Subscription>>>,
    recovery: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn builder(definition_name: impl Into<String>, catalog: DefinitionCatalog) -> OrchestratorBuilder {
        OrchestratorBuilder {
            definition_name: definition_name.into(),
            catalog,
            provider: None,
            publisher: None,
            binder: None,
            services: Services::new(),
            observers: Vec::new(),
            lifetime: None,
            options: OrchestratorOptions::default(),
        }
    }

    pub fn definition_name(&self) -> &str {
        &self.definition_name
    }

    pub fn catalog(&self) -> &DefinitionCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<InstanceStore> {
        &self.store
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn in_flight(&self) -> &InFlightCounter {
        &self.in_flight
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether the recovery loop is (supposed to be) running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn latest_identity(&self) -> Result<DefinitionIdentity, OrchestratorError> {
        self.catalog
            .latest(&self.definition_name)
            .map(|d| d.identity().clone())
            .ok_or_else(|| OrchestratorError::Definition(format!("{} is not registered", self.definition_name)))
    }

    fn start_type(&self) -> Option<String> {
        self.catalog
            .latest(&self.definition_name)
            .map(|d| d.start_type().to_string())
    }

    /// Route one inbound message to a new or existing instance and run it.
    ///
    /// Messages without a correlation token must be start inputs and create a
    /// new instance; messages with one resume the instance it names.
    ///
    /// # Errors
    ///
    /// See [`OrchestratorError::delivery`] for how each error settles the message.
    /// Faulted and aborted executions surface as `WorkflowExecution`.
    pub async fn dispatch(&self, message: Message) -> Result<ExecutionOutcome, OrchestratorError> {
        // Count before the accepting check so a concurrent stop cannot miss this dispatch.
        let _in_flight = self.in_flight.enter();
        if !self.is_accepting() {
            return Err(OrchestratorError::ShuttingDown {
                definition: self.definition_name.clone(),
            });
        }
        if !self.catalog.declares(&self.definition_name, &message.type_tag) {
            return Err(OrchestratorError::UnroutableMessage {
                type_tag: message.type_tag,
                definition: self.definition_name.clone(),
            });
        }
        let identity = self.latest_identity()?;
        let is_start = self.start_type().as_deref() == Some(message.type_tag.as_str());

        match correlation::try_decode(&message)? {
            None if is_start => {
                self.store.ensure_owner(&identity).await?;
                let record = self.store.create(&identity).await?;
                let instance_id = record.instance_id;
                self.executor
                    .run(record, ExecutionInput::Start(message))
                    .await?
                    .into_error(instance_id)
            }
            None => Err(OrchestratorError::MalformedCorrelation {
                token: String::new(),
                reason: format!("resume input {:?} carries no correlation token", message.type_tag),
            }),
            Some(token) if is_start => Err(OrchestratorError::MalformedCorrelation {
                token: token.encode(),
                reason: format!("start input {:?} must not carry a correlation token", message.type_tag),
            }),
            Some(token) => {
                self.store.ensure_owner(&identity).await?;
                let record = self.store.load(token.instance_id).await?;
                if record.status.is_terminal() {
                    tracing::debug!(
                        target: "durohost::runtime",
                        instance_id = %record.instance_id,
                        status = %record.status,
                        "Resume input for finished instance"
                    );
                    return Err(OrchestratorError::InstanceNotFound {
                        instance_id: record.instance_id,
                    });
                }
                let instance_id = record.instance_id;
                self.executor
                    .run(record, ExecutionInput::Resume(message))
                    .await?
                    .into_error(instance_id)
            }
        }
    }

    fn binding_spec(&self, type_tag: String) -> SubscriptionSpec {
        SubscriptionSpec {
            subscription_id: self
                .options
                .subscription_id
                .clone()
                .unwrap_or_else(|| self.definition_name.clone()),
            type_tag,
            topic: Some(self.options.topic.clone().unwrap_or_else(|| self.definition_name.clone())),
            prefetch: self.options.prefetch,
        }
    }

    /// Bind subscriptions for every declared input type and start the recovery loop.
    ///
    /// Idempotent. A failure to acquire the owner lease is logged; the store
    /// retries it on the next operation.
    ///
    /// # Errors
    ///
    /// `Bus` when a binding fails; bindings made so far are cancelled.
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }
        let identity = self.latest_identity()?;
        if let Err(e) = self.store.ensure_owner(&identity).await {
            tracing::warn!(
                target: "durohost::runtime",
                definition = %self.definition_name,
                error = %e,
                "Could not acquire owner lease at startup; will retry"
            );
        }
        self.accepting.store(true, Ordering::SeqCst);

        if let Some(binder) = &self.binder {
            let handler: Arc<dyn MessageHandler> = self.clone();
            let mut bound: Vec<Box<dyn Subscription>> = Vec::new();
            for type_tag in self.catalog.input_types(&self.definition_name) {
                match binder.bind(self.binding_spec(type_tag), handler.clone()).await {
                    Ok(subscription) => bound.push(subscription),
                    Err(e) => {
                        for s in &bound {
                            s.cancel();
                        }
                        tracing::error!(
                            target: "durohost::runtime",
                            definition = %self.definition_name,
                            error = %e,
                            "Failed to bind subscription"
                        );
                        return Err(e.into());
                    }
                }
            }
            *self.subscriptions.lock().unwrap_or_else(|p| p.into_inner()) = bound;
        }

        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(recovery::recovery_loop(self.clone()));
        *self.recovery.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        tracing::info!(
            target: "durohost::runtime",
            definition = %self.definition_name,
            version = %identity.version,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Stop accepting work, stop the recovery loop and wait up to `drain_timeout`
    /// for in-flight executions. In-flight executions are never cancelled.
    pub async fn stop(&self, drain_timeout: Duration) {
        let _lifecycle = self.lifecycle.lock().await;
        self.accepting.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.lifetime
            .request_additional_time(self.options.shutdown_initial_extension);
        self.stop_signal.notify_one();

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(|p| p.into_inner()));
        for s in &subscriptions {
            s.cancel();
        }

        let recovery = self.recovery.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = recovery {
            self.await_recovery_exit(handle).await;
        }

        self.drain(drain_timeout).await;

        self.store.release_owner().await;
        tracing::info!(
            target: "durohost::runtime",
            definition = %self.definition_name,
            "Orchestrator stopped"
        );
    }

    async fn await_recovery_exit(&self, mut handle: JoinHandle<()>) {
        let slice = self.options.recovery_exit_slice;
        for round in 1..=self.options.recovery_exit_rounds.max(1) {
            match tokio::time::timeout(slice, &mut handle).await {
                Ok(_) => return,
                Err(_) => {
                    tracing::debug!(
                        target: "durohost::recovery",
                        round,
                        "Recovery loop has not exited yet"
                    );
                    self.lifetime.request_additional_time(slice);
                }
            }
        }
        tracing::warn!(target: "durohost::recovery", "Recovery loop did not exit in time; aborting it");
        handle.abort();
    }

    async fn drain(&self, drain_timeout: Duration) {
        let interval = self.options.drain_poll_interval.max(Duration::from_millis(1));
        let rounds = drain_timeout.as_millis().div_ceil(interval.as_millis()).max(1);
        let deadline = tokio::time::Instant::now() + drain_timeout;

        for _ in 0..rounds {
            if self.in_flight.current() == 0 {
                break;
            }
            self.lifetime.request_additional_time(self.options.drain_extension);
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = self.in_flight.wait_idle() => break,
                _ = tokio::time::sleep(interval.min(remaining)) => {}
            }
        }

        let still_running = self.in_flight.current();
        if still_running > 0 {
            tracing::warn!(
                target: "durohost::runtime",
                definition = %self.definition_name,
                in_flight = still_running,
                "Shutdown drain timed out with executions still in flight"
            );
        }
    }
}

#[async_trait]
impl MessageHandler for Orchestrator {
    async fn handle(&self, message: Message) -> Delivery {
        self.metrics.record_message_consumed();
        let message_type = message.type_tag.clone();
        match self.dispatch(message).await {
            Ok(_) => Delivery::Ack,
            Err(e) => {
                let delivery = e.delivery();
                match &e {
                    OrchestratorError::ShuttingDown { .. } => {}
                    OrchestratorError::UnexpectedInput { .. } => tracing::error!(
                        target: "durohost::runtime",
                        message_type = %message_type,
                        error = %e,
                        "Dispatch routed an input the instance was not waiting on"
                    ),
                    _ => tracing::warn!(
                        target: "durohost::runtime",
                        message_type = %message_type,
                        delivery = ?delivery,
                        error = %e,
                        "Dispatch failed"
                    ),
                }
                delivery
            }
        }
    }
}
