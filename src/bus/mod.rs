//! Message bus collaborator contracts.
//!
//! The orchestrator only needs three things from a bus: deliver a message to a
//! handler and settle it by the handler's [`Delivery`], bind a durable
//! subscription per input type, and publish outbound messages with an optional
//! topic. [`InMemoryBus`] implements all of them in-process.

use crate::BusError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod in_memory;

pub use in_memory::{DeadLetter, InMemoryBus, InMemoryBusOptions};

/// Topic pattern that matches every topic.
pub const ANY_TOPIC: &str = "#";

/// A message as seen by the orchestrator: declared type tag, opaque payload, headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub type_tag: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl Message {
    pub fn new(type_tag: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            type_tag: type_tag.into(),
            payload,
            headers: BTreeMap::new(),
        }
    }

    /// Serialize `body` as JSON.
    pub fn json<T: Serialize>(type_tag: impl Into<String>, body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(type_tag, serde_json::to_vec(body)?))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// How a delivered message is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Processing finished; remove the message.
    Ack,
    /// Transient failure; deliver the message again later.
    Requeue,
    /// Poison message; never deliver again.
    Reject,
}

/// Consumer side of a subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Delivery;
}

/// Describes one durable binding: messages of `type_tag` published on a
/// matching topic are delivered to the queue named `subscription_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub subscription_id: String,
    pub type_tag: String,
    /// `None` or [`ANY_TOPIC`] binds every topic.
    pub topic: Option<String>,
    /// Maximum number of unsettled deliveries handed to the handler at once.
    pub prefetch: u16,
}

/// A live binding. Cancelling stops delivery; queued messages stay queued.
pub trait Subscription: Send + Sync {
    fn id(&self) -> &str;
    fn cancel(&self);
}

#[async_trait]
pub trait SubscriptionBinder: Send + Sync {
    async fn bind(
        &self,
        spec: SubscriptionSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn Subscription>, BusError>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: Message, topic: Option<&str>) -> Result<(), BusError>;
}

pub(crate) fn topic_matches(binding: Option<&str>, published: Option<&str>) -> bool {
    match binding {
        None | Some(ANY_TOPIC) => true,
        Some(bound) => published == Some(bound),
    }
}
