//! The narrow surface process logic gets back into its host.

use crate::bus::Message;
use crate::correlation::{CORRELATION_HEADER, CorrelationToken};
use crate::{DefinitionIdentity, InstanceId};
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Callbacks from running process logic into the orchestrator.
pub trait HostCapabilities: Send + Sync {
    /// Queue an outbound message; it is sent once the current step is committed.
    fn publish(&self, message: Message, topic: Option<String>);
    fn resolve(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;
    /// Bookmark name used for an awaited input type.
    fn bookmark_name(&self, input_type: &str) -> String;
}

/// Typed service map handed to process logic through [`ProcessContext::resolve`].
#[derive(Clone, Default)]
pub struct Services {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, service: Arc<T>) -> Self {
        self.insert(service);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, service: Arc<T>) {
        self.map.insert(TypeId::of::<T>(), service);
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get_any(TypeId::of::<T>())?.downcast::<T>().ok()
    }

    pub(crate) fn get_any(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.map.get(&type_id).cloned()
    }
}

/// Capabilities for one `Run`: buffers publishes until the executor flushes them.
pub(crate) struct ExecutionScope {
    services: Arc<Services>,
    outbox: Mutex<Vec<(Message, Option<String>)>>,
}

impl ExecutionScope {
    pub(crate) fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            outbox: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn take_outbox(&self) -> Vec<(Message, Option<String>)> {
        std::mem::take(&mut *self.outbox.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl HostCapabilities for ExecutionScope {
    fn publish(&self, message: Message, topic: Option<String>) {
        self.outbox.lock().unwrap_or_else(|p| p.into_inner()).push((message, topic));
    }

    fn resolve(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get_any(type_id)
    }

    fn bookmark_name(&self, input_type: &str) -> String {
        input_type.to_string()
    }
}

/// Handle passed to every step of process logic.
#[derive(Clone)]
pub struct ProcessContext {
    instance_id: InstanceId,
    definition: DefinitionIdentity,
    host: Arc<dyn HostCapabilities>,
}

impl ProcessContext {
    pub fn new(instance_id: InstanceId, definition: DefinitionIdentity, host: Arc<dyn HostCapabilities>) -> Self {
        Self {
            instance_id,
            definition,
            host,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn definition(&self) -> &DefinitionIdentity {
        &self.definition
    }

    /// Token that routes a reply back to this instance.
    pub fn correlation_token(&self) -> CorrelationToken {
        CorrelationToken {
            instance_id: self.instance_id,
            routing_label: self.definition.name.clone(),
        }
    }

    pub fn publish<T: Serialize>(&self, type_tag: &str, body: &T, topic: Option<&str>) -> Result<(), String> {
        let message = Message::json(type_tag, body).map_err(|e| format!("encode {type_tag}: {e}"))?;
        self.publish_message(message, topic);
        Ok(())
    }

    pub fn publish_message(&self, message: Message, topic: Option<&str>) {
        self.host.publish(message, topic.map(str::to_string));
    }

    /// Publish a message that replies can be correlated with.
    ///
    /// Attaches this instance's token unless the message already carries one.
    /// Without an explicit topic the token's routing label is used.
    pub fn publish_correlated<T: Serialize>(&self, type_tag: &str, body: &T, topic: Option<&str>) -> Result<(), String> {
        let message = Message::json(type_tag, body).map_err(|e| format!("encode {type_tag}: {e}"))?;
        self.publish_message_correlated(message, topic);
        Ok(())
    }

    /// Publish `message`, stamping this instance's token unless it already
    /// carries one. A malformed existing header is left as is and logged.
    pub fn publish_message_correlated(&self, mut message: Message, topic: Option<&str>) {
        let label = match message.header(CORRELATION_HEADER).map(CorrelationToken::parse) {
            Some(Ok(existing)) => existing.routing_label,
            Some(Err(e)) => {
                tracing::warn!(
                    target: "durohost::runtime",
                    instance_id = %self.instance_id,
                    message_type = %message.type_tag,
                    error = %e,
                    "Outbound message carries a malformed correlation token; leaving it unchanged"
                );
                self.definition.name.clone()
            }
            None => {
                let own = self.correlation_token();
                message.headers.insert(CORRELATION_HEADER.to_string(), own.encode());
                own.routing_label
            }
        };
        let topic = topic.map(str::to_string).unwrap_or(label);
        self.host.publish(message, Some(topic));
    }

    pub fn resolve<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.host.resolve(TypeId::of::<T>())?.downcast::<T>().ok()
    }

    pub fn bookmark_name(&self, input_type: &str) -> String {
        self.host.bookmark_name(input_type)
    }
}
