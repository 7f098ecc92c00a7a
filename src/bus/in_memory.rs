use super::{Delivery, Message, MessageHandler, Publisher, Subscription, SubscriptionBinder, SubscriptionSpec, topic_matches};
use crate::BusError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct InMemoryBusOptions {
    /// Deliveries per message before it is dead-lettered.
    pub max_deliveries: u32,
    /// Pause before a requeued message becomes visible again.
    pub redelivery_delay: Duration,
    /// Entries kept in the publish log; the oldest are dropped first.
    pub published_log_capacity: usize,
}

impl Default for InMemoryBusOptions {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            redelivery_delay: Duration::from_millis(50),
            published_log_capacity: 1024,
        }
    }
}

/// A message that will not be delivered again.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: String,
    pub message: Message,
    pub deliveries: u32,
    pub reason: String,
}

struct Envelope {
    message: Message,
    deliveries: u32,
}

struct Binding {
    id: u64,
    type_tag: String,
    topic: Option<String>,
    queue: String,
}

struct Queue {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct BusState {
    bindings: Vec<Binding>,
    queues: HashMap<String, Arc<Queue>>,
    published: VecDeque<(Message, Option<String>)>,
    dead_letters: Vec<DeadLetter>,
}

struct BusInner {
    state: Mutex<BusState>,
    next_binding: AtomicU64,
    acked: AtomicU64,
    options: InMemoryBusOptions,
}

/// In-process topic bus.
///
/// Each subscription id names one queue; every binding made with that id routes
/// into it. A queue has a single consumer task that hands messages to the
/// handler with at most `prefetch` deliveries outstanding.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_options(InMemoryBusOptions::default())
    }

    pub fn with_options(options: InMemoryBusOptions) -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState::default()),
                next_binding: AtomicU64::new(1),
                acked: AtomicU64::new(0),
                options,
            }),
        }
    }

    /// The most recent messages accepted by [`Publisher::publish`], oldest
    /// first, with their topics. Bounded by `published_log_capacity`.
    pub fn published(&self) -> Vec<(Message, Option<String>)> {
        self.lock_state().published.iter().cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock_state().dead_letters.clone()
    }

    pub fn acked(&self) -> u64 {
        self.inner.acked.load(Ordering::SeqCst)
    }

    /// Number of live bindings routing into `queue`.
    pub fn binding_count(&self, queue: &str) -> usize {
        self.lock_state().bindings.iter().filter(|b| b.queue == queue).count()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BusState> {
        // A poisoned lock only means a test thread panicked while holding it.
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl BusInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn dead_letter(&self, queue: &str, message: Message, deliveries: u32, reason: &str) {
        tracing::warn!(
            target: "durohost::bus",
            queue = %queue,
            message_type = %message.type_tag,
            deliveries,
            reason,
            "Message dead-lettered"
        );
        self.lock_state().dead_letters.push(DeadLetter {
            queue: queue.to_string(),
            message,
            deliveries,
            reason: reason.to_string(),
        });
    }

    fn settle(self: &Arc<Self>, queue_name: String, queue: Arc<Queue>, envelope: Envelope, delivery: Delivery) {
        match delivery {
            Delivery::Ack => {
                self.acked.fetch_add(1, Ordering::SeqCst);
            }
            Delivery::Reject => self.dead_letter(&queue_name, envelope.message, envelope.deliveries, "rejected"),
            Delivery::Requeue if envelope.deliveries >= self.options.max_deliveries => {
                self.dead_letter(&queue_name, envelope.message, envelope.deliveries, "delivery limit reached")
            }
            Delivery::Requeue => {
                let delay = self.options.redelivery_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // Send only fails once the queue itself is gone.
                    let _ = queue.tx.send(envelope);
                });
            }
        }
    }
}

async fn consume(
    bus: Arc<BusInner>,
    queue_name: String,
    queue: Arc<Queue>,
    handler: Arc<dyn MessageHandler>,
    prefetch: u16,
) {
    let window = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
    loop {
        let Ok(permit) = window.clone().acquire_owned().await else {
            return;
        };
        let next = { queue.rx.lock().await.recv().await };
        let Some(mut envelope) = next else {
            return;
        };
        envelope.deliveries += 1;
        let (bus, queue_name, queue, handler) = (bus.clone(), queue_name.clone(), queue.clone(), handler.clone());
        tokio::spawn(async move {
            let delivery = handler.handle(envelope.message.clone()).await;
            drop(permit);
            bus.settle(queue_name, queue, envelope, delivery);
        });
    }
}

#[async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, message: Message, topic: Option<&str>) -> Result<(), BusError> {
        let mut state = self.lock_state();
        let capacity = self.inner.options.published_log_capacity;
        if capacity > 0 {
            if state.published.len() == capacity {
                state.published.pop_front();
            }
            state.published.push_back((message.clone(), topic.map(str::to_string)));
        }

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.type_tag == message.type_tag && topic_matches(b.topic.as_deref(), topic))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            tracing::debug!(
                target: "durohost::bus",
                message_type = %message.type_tag,
                topic = ?topic,
                "No binding matched published message"
            );
        }
        for name in targets {
            if let Some(queue) = state.queues.get(&name) {
                queue
                    .tx
                    .send(Envelope {
                        message: message.clone(),
                        deliveries: 0,
                    })
                    .map_err(|_| BusError::new("publish", format!("queue {name} is closed")))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionBinder for InMemoryBus {
    async fn bind(
        &self,
        spec: SubscriptionSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn Subscription>, BusError> {
        if spec.subscription_id.is_empty() {
            return Err(BusError::new("bind", "subscription id must not be empty"));
        }
        let id = self.inner.next_binding.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock_state();
        let queue = state
            .queues
            .entry(spec.subscription_id.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                Arc::new(Queue {
                    tx,
                    rx: Arc::new(tokio::sync::Mutex::new(rx)),
                    consumer: Mutex::new(None),
                })
            })
            .clone();
        state.bindings.push(Binding {
            id,
            type_tag: spec.type_tag.clone(),
            topic: spec.topic.clone(),
            queue: spec.subscription_id.clone(),
        });
        drop(state);

        let mut consumer = queue.consumer.lock().unwrap_or_else(|p| p.into_inner());
        if consumer.as_ref().is_none_or(|h| h.is_finished()) {
            *consumer = Some(tokio::spawn(consume(
                self.inner.clone(),
                spec.subscription_id.clone(),
                queue.clone(),
                handler,
                spec.prefetch,
            )));
        }
        drop(consumer);

        tracing::debug!(
            target: "durohost::bus",
            queue = %spec.subscription_id,
            message_type = %spec.type_tag,
            topic = ?spec.topic,
            "Subscription bound"
        );
        Ok(Box::new(InMemorySubscription {
            bus: self.inner.clone(),
            binding_id: id,
            queue: spec.subscription_id,
        }))
    }
}

struct InMemorySubscription {
    bus: Arc<BusInner>,
    binding_id: u64,
    queue: String,
}

impl Subscription for InMemorySubscription {
    fn id(&self) -> &str {
        &self.queue
    }

    fn cancel(&self) {
        let mut state = self.bus.lock_state();
        state.bindings.retain(|b| b.id != self.binding_id);
        if state.bindings.iter().any(|b| b.queue == self.queue) {
            return;
        }
        // Last binding gone: stop consuming, keep whatever is still queued.
        if let Some(queue) = state.queues.get(&self.queue) {
            let mut consumer = queue.consumer.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(handle) = consumer.take() {
                handle.abort();
            }
        }
    }
}
