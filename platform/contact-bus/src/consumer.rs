//! Queue consumer: bind, receive, dispatch, settle
//!
//! Per message:
//! 1. Decode the payload into an [`EventEnvelope`] of the handler's expected
//!    kind. Failure: `nack(requeue = false)`, warning logged, message gone.
//! 2. Invoke the handler with the envelope and routing key.
//! 3. Success: `ack`.
//! 4. Handler error (or panic): `nack(requeue = false)`, error logged.
//!
//! Handlers are spawned as messages arrive, so they may overlap. No error
//! path ends the receive loop; only `stop_consuming`, dropping the
//! `Consumer`, or the broker ending the subscription does.

use crate::routing::derive_queue_name;
use crate::{
    BindingPattern, Broker, BrokerConnection, BusError, BusResult, Delivery, EventEnvelope,
    EventHandler, HandlerError, Subscription,
};
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};

/// Consumer tuning
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// How long `stop_consuming` waits for in-flight handlers before
    /// aborting them (their messages stay unacked and are redelivered)
    pub shutdown_grace: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// How a single delivery was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded, message acked
    Acked,
    /// Payload could not be decoded for this handler, message rejected
    Undecodable(String),
    /// Handler failed, message rejected
    HandlerFailed(String),
}

struct ActiveSubscription {
    consumer_tag: String,
    queue: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Binds queues to the shared exchange and runs handlers for their messages
///
/// The connection is shared (`Arc<BrokerConnection>`): [`Consumer::close`]
/// stops consuming and then closes the connection only if no publisher or
/// other consumer still holds it. Dropping a `Consumer` without closing it
/// still cancels its subscriptions in the background.
///
/// # Example
/// ```rust
/// use contact_bus::{handler_fn, BrokerConnection, Consumer, InMemoryBroker};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let connection = Arc::new(
///     BrokerConnection::open(Arc::new(InMemoryBroker::new()), "contact_events").await?,
/// );
/// let consumer = Consumer::new(connection);
///
/// // Default queue name `queue_ContactEvent`, default pattern `*`
/// consumer
///     .start_consuming(handler_fn(|_, _| async { Ok(()) }), None, None)
///     .await?;
///
/// consumer.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Consumer {
    connection: Arc<BrokerConnection>,
    options: ConsumerOptions,
    active: Mutex<Vec<ActiveSubscription>>,
}

impl Consumer {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self::with_options(connection, ConsumerOptions::default())
    }

    pub fn with_options(connection: Arc<BrokerConnection>, options: ConsumerOptions) -> Self {
        Self {
            connection,
            options,
            active: Mutex::new(Vec::new()),
        }
    }

    /// Start consuming a queue
    ///
    /// # Arguments
    /// * `handler` - Receives each decoded envelope
    /// * `queue_name` - Queue to consume; `None` or empty derives
    ///   `queue_<EventTypeName>` from the handler
    /// * `routing_key_pattern` - Binding pattern; `None` means `*` (everything)
    ///
    /// # Returns
    /// The consumer tag of the new subscription
    ///
    /// # Errors
    /// * `BusError::ConnectionError` if the connection is not open
    /// * `BusError::InvalidPattern` for a malformed pattern
    /// * `BusError::SubscribeError` if declaring, binding or consuming fails
    /// * `BusError::ConnectionError` if the broker closes while the
    ///   subscription is being set up
    pub async fn start_consuming(
        &self,
        handler: Arc<dyn EventHandler>,
        queue_name: Option<&str>,
        routing_key_pattern: Option<&str>,
    ) -> BusResult<String> {
        if !self.connection.is_open() {
            tracing::warn!("Broker not connected, consumer cannot be started");
            return Err(BusError::ConnectionError(
                "connection is not open".to_string(),
            ));
        }

        let queue = match queue_name {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => derive_queue_name(handler.event_type_name()),
        };
        let pattern = BindingPattern::parse(routing_key_pattern.unwrap_or("*"))?;
        let broker = self.connection.broker().clone();
        let exchange = self.connection.exchange();

        let subscription = async {
            broker.declare_queue(&queue).await?;
            broker.bind_queue(&queue, exchange, &pattern).await?;
            broker.consume(&queue).await
        }
        .await
        .map_err(|e| {
            tracing::error!(queue = %queue, pattern = %pattern, error = %e, "Failed to start consumer");
            e
        })?;

        let consumer_tag = subscription.consumer_tag.clone();
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_subscription(
            broker,
            handler,
            subscription,
            stop_rx,
            queue.clone(),
        ));

        tracing::info!(
            queue = %queue,
            pattern = %pattern,
            consumer_tag = %consumer_tag,
            "Consumer started"
        );

        let mut active = self.active.lock().await;
        // Subscriptions whose delivery stream ended have already cleaned up
        active.retain(|sub| !sub.task.is_finished());
        active.push(ActiveSubscription {
            consumer_tag: consumer_tag.clone(),
            queue,
            stop,
            task,
        });

        Ok(consumer_tag)
    }

    /// Cancel every subscription started by this consumer
    ///
    /// Waits up to the shutdown grace period for in-flight handlers to finish.
    /// Calling it with nothing consuming is a no-op.
    pub async fn stop_consuming(&self) {
        let subscriptions = std::mem::take(&mut *self.active.lock().await);
        if subscriptions.is_empty() {
            return;
        }

        let deadline = tokio::time::Instant::now() + self.options.shutdown_grace;
        let mut pending = Vec::with_capacity(subscriptions.len());
        for sub in subscriptions {
            // The task may already be gone if its stream ended
            let _ = sub.stop.send(());
            pending.push((sub.consumer_tag, sub.queue, sub.task));
        }

        for (consumer_tag, queue, mut task) in pending {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {
                    tracing::info!(queue = %queue, consumer_tag = %consumer_tag, "Consumer cancelled");
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        queue = %queue,
                        consumer_tag = %consumer_tag,
                        error = %e,
                        "Consumer task failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        queue = %queue,
                        consumer_tag = %consumer_tag,
                        grace_ms = self.options.shutdown_grace.as_millis(),
                        "Handlers still running after grace period, aborting"
                    );
                    task.abort();
                }
            }
        }

        tracing::info!("All consumers stopped");
    }

    /// True while at least one subscription is still receiving deliveries
    pub async fn is_consuming(&self) -> bool {
        self.active
            .lock()
            .await
            .iter()
            .any(|s| !s.task.is_finished())
    }

    /// Tags of the subscriptions still receiving deliveries
    pub async fn consumer_tags(&self) -> Vec<String> {
        self.active
            .lock()
            .await
            .iter()
            .filter(|s| !s.task.is_finished())
            .map(|s| s.consumer_tag.clone())
            .collect()
    }

    /// Stop consuming, then release the connection if this was its last holder
    pub async fn close(self) {
        self.stop_consuming().await;
        if let Ok(connection) = Arc::try_unwrap(self.connection) {
            connection.close().await;
        }
    }
}

async fn run_subscription(
    broker: Arc<dyn Broker>,
    handler: Arc<dyn EventHandler>,
    subscription: Subscription,
    mut stop: oneshot::Receiver<()>,
    queue: String,
) {
    let Subscription {
        consumer_tag,
        mut deliveries,
    } = subscription;
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            // Explicit stop, or the Consumer was dropped
            _ = &mut stop => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(queue = %queue, error = %e, "Handler task aborted");
                }
            }
            next = deliveries.next() => match next {
                Some(delivery) => {
                    let handler = handler.clone();
                    in_flight.spawn(async move {
                        process_delivery(handler.as_ref(), delivery).await;
                    });
                }
                None => {
                    tracing::warn!(queue = %queue, consumer_tag = %consumer_tag, "Delivery stream ended");
                    break;
                }
            }
        }
    }

    if let Err(e) = broker.cancel(&consumer_tag).await {
        tracing::warn!(consumer_tag = %consumer_tag, error = %e, "Failed to cancel consumer");
    }
    drop(deliveries);

    // In-flight handlers finish and settle before the subscription is gone
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::error!(queue = %queue, error = %e, "Handler task aborted");
        }
    }
}

fn decode_for(handler: &dyn EventHandler, payload: &[u8]) -> BusResult<EventEnvelope> {
    let envelope = EventEnvelope::from_slice(payload)?;
    match handler.expected_kind() {
        Some(expected) if expected != envelope.kind() => Err(BusError::DecodeError(format!(
            "expected {} event, got {}",
            expected,
            envelope.kind()
        ))),
        _ => Ok(envelope),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

async fn settle(result: BusResult<()>, routing_key: &str, action: &str) {
    if let Err(e) = result {
        tracing::error!(routing_key = %routing_key, action = action, error = %e, "Failed to settle delivery");
    }
}

/// Decode, dispatch and settle one delivery
///
/// Never fails: every path ends in an ack or a nack without requeue.
pub async fn process_delivery(handler: &dyn EventHandler, delivery: Delivery) -> DeliveryOutcome {
    let routing_key = delivery.routing_key.clone();

    let envelope = match decode_for(handler, &delivery.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(
                routing_key = %routing_key,
                error = %e,
                payload = %String::from_utf8_lossy(&delivery.payload),
                "Could not decode message, rejecting"
            );
            settle(delivery.nack(false).await, &routing_key, "nack").await;
            return DeliveryOutcome::Undecodable(e.to_string());
        }
    };

    let kind = envelope.kind();
    let subject_id = envelope.subject_id();
    let event_id = envelope.event_id();
    let redelivered = delivery.redelivered;

    let result = AssertUnwindSafe(handler.handle(envelope, &routing_key))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(HandlerError::new(panic_message(panic))));

    match result {
        Ok(()) => {
            settle(delivery.ack().await, &routing_key, "ack").await;
            tracing::info!(
                event_kind = %kind,
                subject_id = subject_id,
                event_id = %event_id,
                routing_key = %routing_key,
                redelivered = redelivered,
                "Event processed"
            );
            DeliveryOutcome::Acked
        }
        Err(e) => {
            tracing::error!(
                event_kind = %kind,
                subject_id = subject_id,
                event_id = %event_id,
                routing_key = %routing_key,
                error = %e,
                "Handler failed, rejecting message"
            );
            settle(delivery.nack(false).await, &routing_key, "nack").await;
            DeliveryOutcome::HandlerFailed(e.to_string())
        }
    }
}
