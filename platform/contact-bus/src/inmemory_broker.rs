//! In-memory implementation of the Broker trait for testing and development

use crate::{
    Acker, BindingPattern, Broker, BusError, BusResult, Delivery, Subscription,
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Broker implementation held entirely in process memory
///
/// This implementation is suitable for:
/// - Unit and integration tests (no external dependencies)
/// - Local development without a broker container
///
/// It follows the same delivery rules as the production transport: every
/// queue bound to an exchange gets its own copy of each matching message,
/// queues keep messages while nobody consumes, deliveries stay unacked until
/// settled, and `nack(requeue = false)` drops the message for good.
///
/// Fault injection hooks ([`disconnect`](Self::disconnect),
/// [`simulate_connection_blip`](Self::simulate_connection_blip)) and
/// inspection helpers exist for tests.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    // Bumped on every change consumers may be waiting for
    changes: watch::Sender<u64>,
}

#[derive(Default)]
struct State {
    open: bool,
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    // consumer tag -> queue
    consumers: HashMap<String, String>,
    reject_publishes: bool,
    next_consumer: u64,
    next_delivery: u64,
    published: u64,
    bytes_published: u64,
}

#[derive(Default)]
struct QueueState {
    bindings: Vec<(String, BindingPattern)>,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    rejected: usize,
}

#[derive(Clone)]
struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

enum Next {
    Delivery(Delivery),
    Wait,
    Done,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    open: true,
                    ..Default::default()
                }),
                changes,
            }),
        }
    }

    /// Drop the connection as if the network went away. Unacked messages go
    /// back to their queues; declared exchanges and queues survive.
    pub fn disconnect(&self) {
        self.shared.shutdown();
    }

    /// Reopen after [`disconnect`](Self::disconnect); queues and their
    /// messages are still there, consumers must re-register
    pub fn reconnect(&self) {
        self.shared.state().open = true;
        self.shared.notify();
    }

    /// Requeue every unacked message as redelivered, as the broker does when a
    /// consumer's channel drops and the client transparently recovers.
    /// Settling one of the old deliveries afterwards fails with `AckError`.
    pub fn simulate_connection_blip(&self) {
        {
            let mut state = self.shared.state();
            for queue in state.queues.values_mut() {
                queue.requeue_unacked();
            }
        }
        self.shared.notify();
    }

    /// While set, every publish fails with `PublishError` even though the
    /// connection stays open
    pub fn reject_publishes(&self, reject: bool) {
        self.shared.state().reject_publishes = reject;
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.shared.state().exchanges.contains(exchange)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.state().queues.contains_key(queue)
    }

    /// Patterns a queue is bound with
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.shared
            .state()
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().map(|(_, p)| p.as_str().to_string()).collect())
            .unwrap_or_default()
    }

    /// Messages waiting for a consumer
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared.state().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Messages dropped through `nack(requeue = false)`
    pub fn rejected_count(&self, queue: &str) -> usize {
        self.shared.state().queues.get(queue).map_or(0, |q| q.rejected)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .state()
            .consumers
            .values()
            .filter(|q| q.as_str() == queue)
            .count()
    }

    /// Messages accepted by [`Broker::publish`]
    pub fn published_count(&self) -> u64 {
        self.shared.state().published
    }

    pub fn bytes_published(&self) -> u64 {
        self.shared.state().bytes_published
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn shutdown(&self) {
        {
            let mut state = self.state();
            state.open = false;
            state.consumers.clear();
            for queue in state.queues.values_mut() {
                queue.requeue_unacked();
            }
        }
        self.notify();
    }

    fn take_next(self: &Arc<Self>, queue: &str, consumer_tag: &str) -> Next {
        let mut state = self.state();
        if !state.open || !state.consumers.contains_key(consumer_tag) {
            return Next::Done;
        }

        let delivery_id = state.next_delivery + 1;
        let Some(q) = state.queues.get_mut(queue) else {
            return Next::Done;
        };
        let Some(message) = q.ready.pop_front() else {
            return Next::Wait;
        };
        q.unacked.insert(delivery_id, message.clone());
        state.next_delivery = delivery_id;

        Next::Delivery(Delivery::new(
            message.routing_key,
            message.payload,
            message.redelivered,
            Box::new(InMemoryAcker {
                shared: self.clone(),
                queue: queue.to_string(),
                delivery_id,
            }),
        ))
    }
}

impl QueueState {
    fn requeue_unacked(&mut self) {
        let mut pending: Vec<(u64, StoredMessage)> = self.unacked.drain().collect();
        pending.sort_by_key(|(id, _)| *id);
        for (_, mut message) in pending.into_iter().rev() {
            message.redelivered = true;
            self.ready.push_front(message);
        }
    }
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    delivery_id: u64,
}

impl InMemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> BusResult<()> {
        let mut state = self.shared.state();
        if !state.open {
            return Err(BusError::AckError("channel closed".to_string()));
        }

        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BusError::AckError(format!("queue '{}' not found", self.queue)))?;
        let mut message = queue.unacked.remove(&self.delivery_id).ok_or_else(|| {
            BusError::AckError(format!("unknown delivery tag {}", self.delivery_id))
        })?;

        match requeue {
            None => {}
            Some(true) => {
                message.redelivered = true;
                queue.ready.push_front(message);
                drop(state);
                self.shared.notify();
            }
            Some(false) => queue.rejected += 1,
        }

        Ok(())
    }
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        self.settle(Some(requeue))
    }
}

fn closed() -> BusError {
    BusError::ConnectionError("connection is closed".to_string())
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &str) -> BusResult<()> {
        let mut state = self.shared.state();
        if !state.open {
            return Err(closed());
        }
        state.exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> BusResult<()> {
        {
            let mut state = self.shared.state();
            if !state.open {
                return Err(BusError::PublishError("channel closed".to_string()));
            }
            if state.reject_publishes {
                return Err(BusError::PublishError("message rejected by broker".to_string()));
            }
            if !state.exchanges.contains(exchange) {
                return Err(BusError::PublishError(format!(
                    "no exchange '{}'",
                    exchange
                )));
            }

            state.published += 1;
            state.bytes_published += payload.len() as u64;

            for queue in state.queues.values_mut() {
                let bound = queue
                    .bindings
                    .iter()
                    .any(|(ex, pattern)| ex == exchange && pattern.matches(routing_key));
                if bound {
                    queue.ready.push_back(StoredMessage {
                        routing_key: routing_key.to_string(),
                        payload: payload.clone(),
                        redelivered: false,
                    });
                }
            }
        }

        self.shared.notify();
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> BusResult<()> {
        let mut state = self.shared.state();
        if !state.open {
            return Err(closed());
        }
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &BindingPattern,
    ) -> BusResult<()> {
        let mut state = self.shared.state();
        if !state.open {
            return Err(closed());
        }
        if !state.exchanges.contains(exchange) {
            return Err(BusError::SubscribeError(format!("no exchange '{}'", exchange)));
        }

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::SubscribeError(format!("no queue '{}'", queue)))?;
        let already_bound = q
            .bindings
            .iter()
            .any(|(ex, p)| ex == exchange && p == pattern);
        if !already_bound {
            q.bindings.push((exchange.to_string(), pattern.clone()));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BusResult<Subscription> {
        let consumer_tag = {
            let mut state = self.shared.state();
            if !state.open {
                return Err(closed());
            }
            if !state.queues.contains_key(queue) {
                return Err(BusError::SubscribeError(format!("no queue '{}'", queue)));
            }
            state.next_consumer += 1;
            let tag = format!("ctag-{}", state.next_consumer);
            state.consumers.insert(tag.clone(), queue.to_string());
            tag
        };

        let shared = self.shared.clone();
        let mut changes = shared.changes.subscribe();
        let queue = queue.to_string();
        let tag = consumer_tag.clone();

        // Pull one message at a time so nothing is handed out ahead of the
        // consumer asking for it
        let deliveries = async_stream::stream! {
            loop {
                let _ = changes.borrow_and_update();
                match shared.take_next(&queue, &tag) {
                    Next::Delivery(delivery) => yield delivery,
                    Next::Done => break,
                    Next::Wait => {
                        if changes.changed().await.is_err() {
                            break;
                        }
                    }
                }
            }
        };

        Ok(Subscription {
            consumer_tag,
            deliveries: deliveries.boxed(),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> BusResult<()> {
        self.shared.state().consumers.remove(consumer_tag);
        self.shared.notify();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.state().open
    }

    async fn close(&self) -> BusResult<()> {
        self.shared.shutdown();
        Ok(())
    }
}
