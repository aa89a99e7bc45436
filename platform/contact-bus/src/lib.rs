//! # Contact Event Bus
//!
//! Broadcasts contact state changes (create/update/delete) as durable,
//! at-least-once messages and consumes them with explicit acknowledgement.
//!
//! ## Topology
//!
//! - One durable fanout **exchange** per deployment (default `contact_events`)
//! - Every published message carries a **routing key** (`contact.created`, ...)
//! - Consumers bind durable **queues** to the exchange with a pattern and get
//!   their own copy of every matching message
//! - A message is `ack`ed after its handler succeeds and `nack`ed without
//!   requeue when it cannot be decoded or its handler fails
//!
//! ## Transports
//!
//! - **NatsBroker**: Production transport over NATS JetStream
//! - **InMemoryBroker**: Test/dev transport with the same ack/nack semantics
//!
//! ## Usage
//!
//! ```rust
//! use contact_bus::{
//!     handler_fn, BrokerConnection, Consumer, ContactDetails, EventEnvelope, InMemoryBroker,
//!     Publisher,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let connection = Arc::new(BrokerConnection::open(broker, "contact_events").await?);
//!
//! let consumer = Consumer::new(connection.clone());
//! consumer
//!     .start_consuming(
//!         handler_fn(|envelope, routing_key| async move {
//!             println!("{} on {}", envelope.subject_id(), routing_key);
//!             Ok(())
//!         }),
//!         None,
//!         Some("contact.created"),
//!     )
//!     .await?;
//!
//! let publisher = Publisher::new(connection.clone());
//! let details = ContactDetails {
//!     name: "Ana".to_string(),
//!     area_code: "11".to_string(),
//!     phone_number: "987654321".to_string(),
//!     email: "a@x.com".to_string(),
//! };
//! publisher.publish(&EventEnvelope::created(1, details), None).await?;
//!
//! consumer.stop_consuming().await;
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod connection;
mod consumer;
pub mod consumer_retry;
mod envelope;
mod handler;
mod inmemory_broker;
mod nats_broker;
mod publisher;
pub mod routing;

pub use config::BrokerConfig;
pub use connection::BrokerConnection;
pub use consumer::{process_delivery, Consumer, ConsumerOptions, DeliveryOutcome};
pub use envelope::{
    ContactChanged, ContactDetails, ContactRemoved, EventEnvelope, EventKind, EventPayload,
};
pub use handler::{handler_fn, EventHandler, FnHandler, HandlerError, HandlerRegistry};
pub use inmemory_broker::InMemoryBroker;
pub use nats_broker::NatsBroker;
pub use publisher::Publisher;
pub use routing::{derive_queue_name, derive_routing_key, BindingPattern};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Broker unreachable, handshake failure, or operation on a closed connection
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// Protocol-level failure during an active publish
    #[error("failed to publish message: {0}")]
    PublishError(String),

    /// Queue declaration, binding or consume registration failed
    #[error("failed to subscribe: {0}")]
    SubscribeError(String),

    #[error("failed to acknowledge delivery: {0}")]
    AckError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Malformed payload on the consumer side
    #[error("decode error: {0}")]
    DecodeError(String),

    #[error("invalid binding pattern: {0}")]
    InvalidPattern(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> BusResult<()>;
    async fn nack(&self, requeue: bool) -> BusResult<()>;
}

/// A message received from a queue, settled exactly once via
/// [`Delivery::ack`] or [`Delivery::nack`]
pub struct Delivery {
    /// Routing key the message was published with
    pub routing_key: String,
    /// Raw message body
    pub payload: Vec<u8>,
    /// True when the broker has delivered this message before
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        routing_key: String,
        payload: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            routing_key,
            payload,
            redelivered,
            acker,
        }
    }

    /// Remove the message from its queue permanently
    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }

    /// Reject the message; with `requeue = false` it is dropped (or
    /// dead-lettered by the broker, if configured)
    pub async fn nack(self, requeue: bool) -> BusResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_bytes", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// An active consumer registration on a queue
pub struct Subscription {
    /// Broker-assigned tag used to cancel the registration
    pub consumer_tag: String,
    /// Deliveries in broker order; ends when the registration is cancelled
    /// or the connection closes
    pub deliveries: BoxStream<'static, Delivery>,
}

/// Broker transport abstraction
///
/// Exposes the exchange/queue/ack primitives the publish and consume layers
/// are built on. Implementations must be safe to call concurrently.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable fanout exchange (idempotent)
    async fn declare_exchange(&self, exchange: &str) -> BusResult<()>;

    /// Publish a message to an exchange with a routing key
    ///
    /// # Returns
    /// * `Ok(())` once the message has been written to the broker
    /// * `Err(BusError::PublishError)` on protocol-level failure
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Declare a durable, non-exclusive, non-auto-delete queue (idempotent)
    async fn declare_queue(&self, queue: &str) -> BusResult<()>;

    /// Bind a queue to an exchange; a queue may carry several bindings
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &BindingPattern)
        -> BusResult<()>;

    /// Start a manual-ack consumer on a queue
    async fn consume(&self, queue: &str) -> BusResult<Subscription>;

    /// Cancel a consumer registration (unknown tags are ignored)
    async fn cancel(&self, consumer_tag: &str) -> BusResult<()>;

    /// True while the underlying connection and channel are usable
    fn is_open(&self) -> bool;

    /// Close the channel and connection (idempotent)
    async fn close(&self) -> BusResult<()>;
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker")
    }
}
