//! NATS JetStream implementation of the Broker trait
//!
//! | Bus concept         | JetStream                                                |
//! |---------------------|----------------------------------------------------------|
//! | exchange `E`        | file-backed stream `E` on `E.>`, interest retention      |
//! | routing key `k`     | subject `E.k`                                            |
//! | queue `Q`           | durable pull consumer `Q`, explicit ack                  |
//! | binding pattern `p` | consumer filter subject(s) `E.p`                         |
//! | `ack`               | `+ACK`                                                   |
//! | `nack(requeue)`     | `-NAK` when requeueing, `+TERM` otherwise                |
//! | vhost               | JetStream domain (`/` = default domain)                  |

use crate::{
    Acker, BindingPattern, Broker, BrokerConfig, BusError, BusResult, Delivery, Subscription,
};
use async_nats::connection::State;
use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use futures::stream::{AbortHandle, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Broker implementation over NATS JetStream
///
/// This is the production transport. It wraps an `async_nats::Client` and a
/// JetStream context.
///
/// # Example
/// ```rust,no_run
/// use contact_bus::{BindingPattern, Broker, BrokerConfig, NatsBroker};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = NatsBroker::connect(&BrokerConfig::default()).await?;
/// broker.declare_exchange("contact_events").await?;
/// broker.publish("contact_events", "contact.created", b"{}".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBroker {
    client: Client,
    jetstream: jetstream::Context,
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    closed: AtomicBool,
    queues: Mutex<HashMap<String, QueueBindings>>,
    consumers: Mutex<HashMap<String, AbortHandle>>,
}

#[derive(Debug, Default, Clone)]
struct QueueBindings {
    exchange: Option<String>,
    filters: Vec<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl NatsBroker {
    /// Connect with the credentials, timeout and vhost/domain from `config`
    ///
    /// # Errors
    /// `BusError::ConnectionError` if the server is unreachable or rejects
    /// the handshake
    pub async fn connect(config: &BrokerConfig) -> BusResult<Self> {
        let url = config.server_url();
        let client = ConnectOptions::with_user_and_password(
            config.user.clone(),
            config.password.clone(),
        )
        .connection_timeout(config.connect_timeout)
        .connect(url.as_str())
        .await
        .map_err(|e| {
            tracing::error!(url = %url, error = %e, "Broker not reachable");
            BusError::ConnectionError(format!("{}: {}", url, e))
        })?;

        tracing::info!(url = %url, vhost = %config.vhost, "Connected to broker");
        Ok(Self::new(client, config.jetstream_domain()))
    }

    /// Create a NatsBroker from an existing NATS client
    ///
    /// # Arguments
    /// * `client` - An already-connected `async_nats::Client`
    /// * `domain` - JetStream domain, `None` for the default one
    pub fn new(client: Client, domain: Option<String>) -> Self {
        let jetstream = match domain {
            Some(domain) => jetstream::with_domain(client.clone(), domain),
            None => jetstream::new(client.clone()),
        };

        Self {
            client,
            jetstream,
            inner: Arc::new(Inner::default()),
        }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn stream(&self, exchange: &str) -> BusResult<stream::Stream> {
        self.jetstream
            .get_stream(exchange)
            .await
            .map_err(|e| BusError::SubscribeError(format!("exchange '{}': {}", exchange, e)))
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BusError::ConnectionError("connection is closed".to_string()))
        }
    }
}

/// Collapse a filter set that includes the catch-all so JetStream does not
/// reject overlapping filters
fn merge_filters(existing: &[String], added: Vec<String>, exchange: &str) -> Vec<String> {
    let catch_all = format!("{}.>", exchange);
    let mut filters: Vec<String> = existing.to_vec();
    for filter in added {
        if !filters.contains(&filter) {
            filters.push(filter);
        }
    }
    if filters.contains(&catch_all) {
        vec![catch_all]
    } else {
        filters
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
        self.message
            .ack_with(kind)
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn declare_exchange(&self, exchange: &str) -> BusResult<()> {
        self.ensure_open()?;

        let config = stream::Config {
            name: exchange.to_string(),
            subjects: vec![format!("{}.>", exchange)],
            retention: stream::RetentionPolicy::Interest,
            storage: stream::StorageType::File,
            max_age: Duration::from_secs(60 * 60 * 24 * 14), // 14 days
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| BusError::ConnectionError(format!("declare exchange '{}': {}", exchange, e)))?;

        tracing::debug!(exchange = %exchange, "Exchange declared");
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> BusResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::PublishError("channel closed".to_string()));
        }

        // Core publish: the stream captures the subject, no ack round-trip
        self.client
            .publish(format!("{}.{}", exchange, routing_key), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> BusResult<()> {
        self.ensure_open()?;

        if lock(&self.inner.queues).contains_key(queue) {
            return Ok(());
        }

        // A durable consumer may already exist from an earlier run; pick up
        // its filters so new bindings extend rather than replace them
        let mut bindings = QueueBindings::default();
        for name in self.jetstream.stream_names().collect::<Vec<_>>().await {
            let Ok(name) = name else { continue };
            let Ok(stream) = self.jetstream.get_stream(&name).await else {
                continue;
            };
            if let Ok(existing) = stream.get_consumer::<consumer::pull::Config>(queue).await {
                let config = &existing.cached_info().config;
                bindings.exchange = Some(name);
                bindings.filters = config.filter_subjects.clone();
                if !config.filter_subject.is_empty() {
                    bindings.filters.push(config.filter_subject.clone());
                }
                break;
            }
        }

        lock(&self.inner.queues)
            .entry(queue.to_string())
            .or_insert(bindings);
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &BindingPattern,
    ) -> BusResult<()> {
        self.ensure_open()?;

        let current = lock(&self.inner.queues)
            .get(queue)
            .cloned()
            .ok_or_else(|| BusError::SubscribeError(format!("no queue '{}'", queue)))?;

        if let Some(bound) = current.exchange.as_deref() {
            if bound != exchange {
                return Err(BusError::SubscribeError(format!(
                    "queue '{}' is already bound to exchange '{}'",
                    queue, bound
                )));
            }
        }

        let filters = merge_filters(&current.filters, pattern.subject_filters(exchange), exchange);
        let stream = self.stream(exchange).await?;

        stream
            .create_consumer(consumer::pull::Config {
                durable_name: Some(queue.to_string()),
                filter_subjects: filters.clone(),
                ack_policy: consumer::AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::SubscribeError(format!("bind '{}': {}", queue, e)))?;

        lock(&self.inner.queues).insert(
            queue.to_string(),
            QueueBindings {
                exchange: Some(exchange.to_string()),
                filters,
            },
        );

        tracing::debug!(queue = %queue, exchange = %exchange, pattern = %pattern, "Queue bound");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BusResult<Subscription> {
        self.ensure_open()?;

        let exchange = lock(&self.inner.queues)
            .get(queue)
            .and_then(|b| b.exchange.clone())
            .ok_or_else(|| {
                BusError::SubscribeError(format!("queue '{}' has no bindings", queue))
            })?;

        let pull: consumer::PullConsumer = self
            .stream(&exchange)
            .await?
            .get_consumer(queue)
            .await
            .map_err(|e| BusError::SubscribeError(format!("queue '{}': {}", queue, e)))?;

        let messages = pull
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(format!("consume '{}': {}", queue, e)))?;

        let prefix = format!("{}.", exchange);
        let queue_name = queue.to_string();
        let deliveries = messages.filter_map(move |result| {
            let delivery = match result {
                Ok(message) => {
                    let routing_key = message
                        .subject
                        .as_str()
                        .strip_prefix(prefix.as_str())
                        .unwrap_or(message.subject.as_str())
                        .to_string();
                    let redelivered = message.info().map(|i| i.delivered > 1).unwrap_or(false);
                    let payload = message.payload.to_vec();
                    Some(Delivery::new(
                        routing_key,
                        payload,
                        redelivered,
                        Box::new(NatsAcker { message }),
                    ))
                }
                Err(e) => {
                    tracing::warn!(queue = %queue_name, error = %e, "Error receiving from queue");
                    None
                }
            };
            futures::future::ready(delivery)
        });

        let (deliveries, abort) = futures::stream::abortable(deliveries);
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4().simple());
        lock(&self.inner.consumers).insert(consumer_tag.clone(), abort);

        Ok(Subscription {
            consumer_tag,
            deliveries: deliveries.boxed(),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> BusResult<()> {
        if let Some(handle) = lock(&self.inner.consumers).remove(consumer_tag) {
            handle.abort();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
            && self.client.connection_state() == State::Connected
    }

    async fn close(&self) -> BusResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for (_, handle) in lock(&self.inner.consumers).drain() {
            handle.abort();
        }

        // Push out anything still buffered; the socket goes away with the
        // last client handle
        self.client
            .flush()
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))
    }
}
