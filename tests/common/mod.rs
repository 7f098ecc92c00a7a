#![allow(dead_code)]

pub mod fault_injection;
pub mod tracing_capture;

use durohost::bus::Message;
use durohost::providers::sqlite::SqliteProvider;
use durohost::providers::{InstanceStore, Provider, RetryPolicy, StoreOptions};
use durohost::runtime::catalog::{DefinitionCatalog, ProcessDefinition, ProcessDefinitionBuilder, Step};
use durohost::runtime::{Orchestrator, OrchestratorOptions};
use durohost::{CORRELATION_HEADER, InstanceId, InstanceRecord};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartGreeting {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetingReply {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Greeting {
    pub name: String,
}

/// Greeter: start on `StartGreeting`, wait for `GreetingReply`, then complete.
pub fn greeter_definition(version: &str) -> ProcessDefinitionBuilder {
    ProcessDefinition::builder("Greeter", "demo", version)
        .on_start("StartGreeting", |_ctx, input: StartGreeting| async move {
            Step::await_message("GreetingReply", &Greeting { name: input.name })
        })
        .on_resume("GreetingReply", |_ctx, _state: Greeting, _reply: GreetingReply| async move {
            Ok(Step::Complete)
        })
}

pub fn greeter_catalog() -> DefinitionCatalog {
    DefinitionCatalog::builder()
        .register(greeter_definition("1.0.0").build().unwrap())
        .build()
        .unwrap()
}

/// Options with timeouts short enough for tests.
pub fn fast_options() -> OrchestratorOptions {
    OrchestratorOptions {
        store: fast_store_options(),
        recovery_poll_timeout: Duration::from_millis(200),
        claim_timeout: Duration::from_millis(200),
        recovery_restart_delay: Duration::from_millis(20),
        recovery_exit_slice: Duration::from_secs(1),
        drain_poll_interval: Duration::from_millis(100),
        ..OrchestratorOptions::default()
    }
}

pub fn fast_store_options() -> StoreOptions {
    StoreOptions {
        owner_create_timeout: Duration::from_secs(2),
        owner_release_timeout: Duration::from_secs(1),
        instance_claim_duration: Duration::from_secs(2),
        load_retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(2),
        },
        ..StoreOptions::default()
    }
}

pub fn greeter_orchestrator(provider: Arc<dyn Provider>) -> Arc<Orchestrator> {
    Orchestrator::builder("Greeter", greeter_catalog())
        .provider(provider)
        .options(fast_options())
        .build()
        .unwrap()
}

pub fn start_greeting(name: &str) -> Message {
    Message::json("StartGreeting", &StartGreeting { name: name.to_string() }).unwrap()
}

pub fn reply_to(instance_id: InstanceId, label: &str, text: &str) -> Message {
    Message::json("GreetingReply", &GreetingReply { text: text.to_string() })
        .unwrap()
        .with_header(CORRELATION_HEADER, format!("{instance_id}|{label}"))
}

/// Poll `check` every 5ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll the store until the instance reaches a state matching `predicate`.
pub async fn wait_for_instance<F>(
    provider: &Arc<dyn Provider>,
    instance_id: InstanceId,
    predicate: F,
    timeout: Duration,
) -> Option<InstanceRecord>
where
    F: Fn(&InstanceRecord) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(Some(record)) = provider.read_instance(instance_id).await
            && predicate(&record)
        {
            return Some(record);
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn create_sqlite_store_disk() -> (Arc<SqliteProvider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    std::fs::File::create(&db_path).unwrap();
    let db_url = format!("sqlite:{}", db_path.display());
    let store = Arc::new(SqliteProvider::new(&db_url, None).await.unwrap());
    (store, td)
}

pub fn store_over(provider: Arc<dyn Provider>) -> InstanceStore {
    InstanceStore::new(provider, fast_store_options())
}

/// Keeps every lifecycle event for later assertions.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<durohost::runtime::LifecycleEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<durohost::runtime::LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: durohost::runtime::LifecycleKind) -> Vec<durohost::runtime::LifecycleEvent> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }
}

impl durohost::runtime::LifecycleObserver for RecordingObserver {
    fn on_event(&self, event: &durohost::runtime::LifecycleEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
