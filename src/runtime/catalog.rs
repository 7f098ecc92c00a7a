//! Versioned catalog of process definitions.
//!
//! A [`ProcessDefinition`] declares one start input type, the resume input
//! types it can suspend on, and a handler for each of them. Handlers are
//! looked up by input type tag, so dispatch never needs to know concrete types.
//! The [`DefinitionCatalog`] keeps every registered version of each definition;
//! new instances start on the latest version and resume on the version they
//! were created with.

use super::context::ProcessContext;
use crate::{DefinitionIdentity, OrchestratorError, TIMER_BOOKMARK};
use async_trait::async_trait;
use semver::Version;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Where a step of process logic left the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Wait for any of `awaiting` (and/or `delay`), keeping `state` as the continuation.
    Suspend {
        awaiting: BTreeSet<String>,
        state: Vec<u8>,
        delay: Option<Duration>,
    },
    Complete,
    Cancel,
}

impl Step {
    pub fn await_message<S: Serialize>(input_type: impl Into<String>, state: &S) -> Result<Self, String> {
        Self::await_any([input_type.into()], state)
    }

    pub fn await_any<S, I>(input_types: I, state: &S) -> Result<Self, String>
    where
        S: Serialize,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Ok(Self::Suspend {
            awaiting: input_types.into_iter().map(Into::into).collect(),
            state: encode_state(state)?,
            delay: None,
        })
    }

    /// Suspend until `after` has elapsed; the timer handler runs next.
    pub fn delay<S: Serialize>(after: Duration, state: &S) -> Result<Self, String> {
        Ok(Self::Suspend {
            awaiting: BTreeSet::new(),
            state: encode_state(state)?,
            delay: Some(after),
        })
    }

    /// Add a durable delay to a suspension, whichever fires first wins.
    pub fn with_delay(self, after: Duration) -> Self {
        match self {
            Self::Suspend { awaiting, state, .. } => Self::Suspend {
                awaiting,
                state,
                delay: Some(after),
            },
            other => other,
        }
    }
}

fn encode_state<S: Serialize>(state: &S) -> Result<Vec<u8>, String> {
    serde_json::to_vec(state).map_err(|e| format!("state could not be encoded: {e}"))
}

/// Failure of a step handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Business fault raised by the process logic.
    Fault(String),
    /// The host could not run the step (undecodable input or state).
    Abort(String),
}

/// Trait implemented by step handlers that the executor invokes.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn invoke(&self, ctx: ProcessContext, state: Option<Vec<u8>>, payload: Vec<u8>) -> Result<Step, StepError>;
}

/// Function wrapper that implements `StepHandler`.
pub struct FnStep<F, Fut>(pub F)
where
    F: Fn(ProcessContext, Option<Vec<u8>>, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Step, StepError>> + Send + 'static;

#[async_trait]
impl<F, Fut> StepHandler for FnStep<F, Fut>
where
    F: Fn(ProcessContext, Option<Vec<u8>>, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Step, StepError>> + Send + 'static,
{
    async fn invoke(&self, ctx: ProcessContext, state: Option<Vec<u8>>, payload: Vec<u8>) -> Result<Step, StepError> {
        (self.0)(ctx, state, payload).await
    }
}

fn decode_input<In: DeserializeOwned>(payload: &[u8]) -> Result<In, StepError> {
    serde_json::from_slice(payload).map_err(|e| StepError::Abort(format!("input could not be decoded: {e}")))
}

fn decode_state<S: DeserializeOwned>(state: Option<&[u8]>) -> Result<S, StepError> {
    let bytes = state.ok_or_else(|| StepError::Abort("instance has no checkpointed state".to_string()))?;
    serde_json::from_slice(bytes).map_err(|e| StepError::Abort(format!("state could not be decoded: {e}")))
}

async fn settle<Fut>(step: Result<Fut, StepError>) -> Result<Step, StepError>
where
    Fut: Future<Output = Result<Step, String>>,
{
    step?.await.map_err(StepError::Fault)
}

/// Immutable template for one version of a process.
pub struct ProcessDefinition {
    identity: DefinitionIdentity,
    start_type: String,
    start: Arc<dyn StepHandler>,
    resumes: BTreeMap<String, Arc<dyn StepHandler>>,
    timer: Option<Arc<dyn StepHandler>>,
}

impl std::fmt::Debug for ProcessDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessDefinition")
            .field("identity", &self.identity)
            .field("start_type", &self.start_type)
            .field("resume_types", &self.resumes.keys().collect::<Vec<_>>())
            .field("has_timer", &self.timer.is_some())
            .finish()
    }
}

impl ProcessDefinition {
    pub fn builder(
        name: impl Into<String>,
        namespace: impl Into<String>,
        version: impl AsRef<str>,
    ) -> ProcessDefinitionBuilder {
        let mut errors = Vec::new();
        let version = Version::parse(version.as_ref()).unwrap_or_else(|e| {
            errors.push(format!("invalid version {:?}: {e}", version.as_ref()));
            Version::new(0, 0, 0)
        });
        ProcessDefinitionBuilder {
            identity: DefinitionIdentity::new(name, namespace, version),
            start: None,
            resumes: BTreeMap::new(),
            timer: None,
            errors,
        }
    }

    pub fn identity(&self) -> &DefinitionIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn start_type(&self) -> &str {
        &self.start_type
    }

    pub fn resume_types(&self) -> impl Iterator<Item = &str> {
        self.resumes.keys().map(String::as_str)
    }

    /// Start type followed by every resume type.
    pub fn input_types(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.start_type.as_str()).chain(self.resume_types())
    }

    pub fn declares(&self, input_type: &str) -> bool {
        self.start_type == input_type || self.resumes.contains_key(input_type)
    }

    pub fn start_handler(&self) -> Arc<dyn StepHandler> {
        Arc::clone(&self.start)
    }

    pub fn resume_handler(&self, input_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.resumes.get(input_type).cloned()
    }

    pub fn timer_handler(&self) -> Option<Arc<dyn StepHandler>> {
        self.timer.clone()
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }
}

pub struct ProcessDefinitionBuilder {
    identity: DefinitionIdentity,
    start: Option<(String, Arc<dyn StepHandler>)>,
    resumes: BTreeMap<String, Arc<dyn StepHandler>>,
    timer: Option<Arc<dyn StepHandler>>,
    errors: Vec<String>,
}

impl ProcessDefinitionBuilder {
    fn check_tag(&mut self, input_type: &str) -> bool {
        let problem = if input_type.is_empty() {
            Some("input type must not be empty".to_string())
        } else if input_type == TIMER_BOOKMARK {
            Some(format!("{TIMER_BOOKMARK:?} is reserved for durable delays"))
        } else if self.start.as_ref().is_some_and(|(s, _)| s == input_type) || self.resumes.contains_key(input_type) {
            Some(format!("duplicate input type registration: {input_type}"))
        } else {
            None
        };
        match problem {
            Some(p) => {
                self.errors.push(p);
                false
            }
            None => true,
        }
    }

    /// Register the raw start handler.
    pub fn on_start_raw(mut self, input_type: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        let input_type = input_type.into();
        if self.start.is_some() {
            self.errors
                .push(format!("start input already registered; cannot also start on {input_type}"));
            return self;
        }
        if self.check_tag(&input_type) {
            self.start = Some((input_type, handler));
        }
        self
    }

    pub fn on_resume_raw(mut self, input_type: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        let input_type = input_type.into();
        if self.check_tag(&input_type) {
            self.resumes.insert(input_type, handler);
        }
        self
    }

    /// Handle the start input, decoded from JSON.
    pub fn on_start<In, F, Fut>(self, input_type: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        F: Fn(ProcessContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Step, String>> + Send + 'static,
    {
        let handler = FnStep(move |ctx: ProcessContext, _state: Option<Vec<u8>>, payload: Vec<u8>| {
            settle(decode_input::<In>(&payload).map(|input| f(ctx, input)))
        });
        self.on_start_raw(input_type, Arc::new(handler))
    }

    /// Handle a resume input together with the state checkpointed at suspension.
    pub fn on_resume<S, In, F, Fut>(self, input_type: impl Into<String>, f: F) -> Self
    where
        S: DeserializeOwned + Send + 'static,
        In: DeserializeOwned + Send + 'static,
        F: Fn(ProcessContext, S, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Step, String>> + Send + 'static,
    {
        let handler = FnStep(move |ctx: ProcessContext, state: Option<Vec<u8>>, payload: Vec<u8>| {
            let step = decode_state::<S>(state.as_deref())
                .and_then(|s| decode_input::<In>(&payload).map(|input| f(ctx, s, input)));
            settle(step)
        });
        self.on_resume_raw(input_type, Arc::new(handler))
    }

    /// Handle an elapsed durable delay.
    pub fn on_timer<S, F, Fut>(mut self, f: F) -> Self
    where
        S: DeserializeOwned + Send + 'static,
        F: Fn(ProcessContext, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Step, String>> + Send + 'static,
    {
        if self.timer.is_some() {
            self.errors.push("timer handler already registered".to_string());
            return self;
        }
        let handler = FnStep(move |ctx: ProcessContext, state: Option<Vec<u8>>, _payload: Vec<u8>| {
            settle(decode_state::<S>(state.as_deref()).map(|s| f(ctx, s)))
        });
        self.timer = Some(Arc::new(handler));
        self
    }

    /// # Errors
    ///
    /// `Definition` listing every registration problem.
    pub fn build(mut self) -> Result<ProcessDefinition, OrchestratorError> {
        if self.identity.name.is_empty() {
            self.errors.push("definition name must not be empty".to_string());
        }
        if self.identity.name.contains(crate::correlation::SEPARATOR) {
            self.errors
                .push(format!("definition name {:?} contains the correlation separator", self.identity.name));
        }
        let Some((start_type, start)) = self.start.take() else {
            self.errors.push(format!("{} has no start input", self.identity.name));
            return Err(OrchestratorError::Definition(self.errors.join("; ")));
        };
        if !self.errors.is_empty() {
            return Err(OrchestratorError::Definition(self.errors.join("; ")));
        }
        Ok(ProcessDefinition {
            identity: self.identity,
            start_type,
            start,
            resumes: self.resumes,
            timer: self.timer,
        })
    }
}

/// Immutable catalog mapping definition names to their registered versions.
#[derive(Clone, Default)]
pub struct DefinitionCatalog {
    inner: Arc<HashMap<String, BTreeMap<Version, Arc<ProcessDefinition>>>>,
}

pub struct CatalogBuilder {
    map: HashMap<String, BTreeMap<Version, Arc<ProcessDefinition>>>,
    errors: Vec<String>,
}

impl DefinitionCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Latest registered version of `name`.
    pub fn latest(&self, name: &str) -> Option<Arc<ProcessDefinition>> {
        let found = self.inner.get(name).and_then(|m| m.values().next_back().cloned());
        if found.is_none() {
            self.log_catalog_miss(name, None);
        }
        found
    }

    /// The exact version an instance was created with.
    pub fn exact(&self, identity: &DefinitionIdentity) -> Option<Arc<ProcessDefinition>> {
        let found = self
            .inner
            .get(&identity.name)
            .and_then(|m| m.get(&identity.version).cloned());
        if found.is_none() {
            self.log_catalog_miss(&identity.name, Some(&identity.version));
        }
        found
    }

    /// Every input type any version of `name` declares, so older instances still get their inputs.
    pub fn input_types(&self, name: &str) -> BTreeSet<String> {
        self.inner
            .get(name)
            .map(|versions| {
                versions
                    .values()
                    .flat_map(|d| d.input_types().map(str::to_string).collect::<Vec<_>>())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn declares(&self, name: &str, input_type: &str) -> bool {
        self.inner
            .get(name)
            .is_some_and(|versions| versions.values().any(|d| d.declares(input_type)))
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    fn log_catalog_miss(&self, name: &str, requested_version: Option<&Version>) {
        tracing::debug!(
            target: "durohost::registry",
            requested_name = %name,
            requested_version = ?requested_version,
            available_versions_for_name = ?self.list_versions(name),
            registered_names = ?self.list_names(),
            "Definition catalog lookup miss"
        );
    }
}

impl CatalogBuilder {
    pub fn register(mut self, definition: ProcessDefinition) -> Self {
        let name = definition.identity.name.clone();
        let version = definition.identity.version.clone();
        let entry = self.map.entry(name.clone()).or_default();
        if let Some((latest, existing)) = entry.iter().next_back() {
            if &version <= latest {
                self.errors.push(format!(
                    "non-monotonic definition version for {name}: {version} is not later than existing latest {latest}"
                ));
                return self;
            }
            if existing.start_type != definition.start_type {
                self.errors.push(format!(
                    "{name}@{version} starts on {} but earlier versions start on {}",
                    definition.start_type, existing.start_type
                ));
                return self;
            }
        }
        entry.insert(version, Arc::new(definition));
        self
    }

    /// # Errors
    ///
    /// `Definition` joining every registration error.
    pub fn build(self) -> Result<DefinitionCatalog, OrchestratorError> {
        if !self.errors.is_empty() {
            return Err(OrchestratorError::Definition(self.errors.join("; ")));
        }
        Ok(DefinitionCatalog {
            inner: Arc::new(self.map),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Empty {}

    fn greeter(version: &str) -> ProcessDefinitionBuilder {
        ProcessDefinition::builder("Greeter", "demo", version)
            .on_start("StartGreeting", |_ctx, _in: Empty| async { Step::await_message("GreetingReply", &Empty {}) })
            .on_resume("GreetingReply", |_ctx, _s: Empty, _in: Empty| async { Ok(Step::Complete) })
    }

    #[test]
    fn definition_declares_inputs() {
        let def = greeter("1.0.0").build().unwrap();
        assert_eq!(def.start_type(), "StartGreeting");
        assert_eq!(def.input_types().collect::<Vec<_>>(), vec!["StartGreeting", "GreetingReply"]);
        assert!(def.declares("GreetingReply"));
        assert!(!def.declares("Other"));
        assert!(def.resume_handler("GreetingReply").is_some());
        assert!(!def.has_timer());
    }

    #[test]
    fn builder_collects_errors() {
        let err = ProcessDefinition::builder("Greeter", "demo", "not-semver")
            .on_start("A", |_ctx, _in: Empty| async { Ok(Step::Complete) })
            .on_resume("A", |_ctx, _s: Empty, _in: Empty| async { Ok(Step::Complete) })
            .on_resume(TIMER_BOOKMARK, |_ctx, _s: Empty, _in: Empty| async { Ok(Step::Complete) })
            .build()
            .unwrap_err();
        let OrchestratorError::Definition(msg) = err else {
            panic!("expected definition error");
        };
        assert!(msg.contains("invalid version"), "{msg}");
        assert!(msg.contains("duplicate input type"), "{msg}");
        assert!(msg.contains("reserved"), "{msg}");
    }

    #[test]
    fn start_is_required() {
        let err = ProcessDefinition::builder("Greeter", "demo", "1.0.0")
            .on_resume("GreetingReply", |_ctx, _s: Empty, _in: Empty| async { Ok(Step::Complete) })
            .build()
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Definition(m) if m.contains("no start input")));
    }

    #[test]
    fn catalog_resolves_latest_and_exact() {
        let v2 = greeter("2.0.0")
            .on_resume("Nudge", |_ctx, _s: Empty, _in: Empty| async { Ok(Step::Complete) })
            .build()
            .unwrap();
        let catalog = DefinitionCatalog::builder()
            .register(greeter("1.0.0").build().unwrap())
            .register(v2)
            .build()
            .unwrap();

        assert_eq!(catalog.latest("Greeter").unwrap().identity().version, Version::new(2, 0, 0));
        let v1 = DefinitionIdentity::new("Greeter", "demo", Version::new(1, 0, 0));
        assert!(catalog.exact(&v1).is_some());
        assert!(catalog.latest("Missing").is_none());
        assert!(catalog.declares("Greeter", "Nudge"));
        assert_eq!(
            catalog.input_types("Greeter"),
            ["GreetingReply", "Nudge", "StartGreeting"]
                .into_iter()
                .map(String::from)
                .collect::<BTreeSet<String>>()
        );
    }

    #[test]
    fn catalog_rejects_non_monotonic_versions() {
        let result = DefinitionCatalog::builder()
            .register(greeter("2.0.0").build().unwrap())
            .register(greeter("1.0.0").build().unwrap())
            .build();
        assert!(matches!(result, Err(OrchestratorError::Definition(m)) if m.contains("non-monotonic")));
    }

    #[test]
    fn step_helpers() {
        let s = Step::await_any(["A", "B"], &Empty {}).unwrap().with_delay(Duration::from_secs(1));
        let Step::Suspend { awaiting, delay, .. } = s else {
            panic!("expected suspend");
        };
        assert_eq!(awaiting.len(), 2);
        assert_eq!(delay, Some(Duration::from_secs(1)));
        assert_eq!(Step::Complete.with_delay(Duration::from_secs(1)), Step::Complete);
    }
}
