//! Publishes contact events to the shared exchange

use crate::routing::effective_routing_key;
use crate::{BrokerConnection, BusError, BusResult, EventEnvelope};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Turns envelopes into wire messages on the fanout exchange
///
/// Publishing is fire-and-forget at the protocol level: there is no
/// publisher-side confirm, durability comes from the durable exchange and
/// queues. Concurrent `publish` calls are serialized onto the channel.
///
/// While the connection is down, `publish` logs a warning and returns `Ok`
/// without sending anything; the event is lost. Failures during an active
/// publish are returned as [`BusError::PublishError`].
pub struct Publisher {
    connection: Arc<BrokerConnection>,
    // Single-writer discipline on the shared channel
    write_lock: Mutex<()>,
    dropped: AtomicU64,
}

impl Publisher {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self {
            connection,
            write_lock: Mutex::new(()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Health predicate of the underlying connection
    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Events skipped because the connection was not open
    pub fn dropped_while_disconnected(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Publish an envelope
    ///
    /// # Arguments
    /// * `envelope` - The event to publish
    /// * `routing_key_override` - Explicit routing key; `None` or empty uses
    ///   `contact.<kind>`
    ///
    /// # Returns
    /// * `Ok(())` when written to the broker, or skipped because disconnected
    /// * `Err(BusError::PublishError)` if the broker write failed
    pub async fn publish(
        &self,
        envelope: &EventEnvelope,
        routing_key_override: Option<&str>,
    ) -> BusResult<()> {
        if !self.connection.is_open() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                event_kind = %envelope.kind(),
                subject_id = envelope.subject_id(),
                event_id = %envelope.event_id(),
                "Broker not connected, event will not be published"
            );
            return Ok(());
        }

        let routing_key = effective_routing_key(envelope.kind(), routing_key_override);
        let body = envelope.to_bytes()?;
        let payload_bytes = body.len();
        let payload = String::from_utf8_lossy(&body).into_owned();

        let result = {
            let _guard = self.write_lock.lock().await;
            self.connection
                .broker()
                .publish(self.connection.exchange(), &routing_key, body)
                .await
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    event_kind = %envelope.kind(),
                    subject_id = envelope.subject_id(),
                    event_id = %envelope.event_id(),
                    routing_key = %routing_key,
                    payload_bytes = payload_bytes,
                    payload = %payload,
                    "Event published"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    event_kind = %envelope.kind(),
                    subject_id = envelope.subject_id(),
                    routing_key = %routing_key,
                    error = %e,
                    "Failed to publish event"
                );
                Err(match e {
                    BusError::PublishError(_) => e,
                    other => BusError::PublishError(other.to_string()),
                })
            }
        }
    }

    /// Release this publisher; the connection is closed when no other
    /// publisher or consumer still holds it
    pub async fn close(self) {
        if let Ok(connection) = Arc::try_unwrap(self.connection) {
            connection.close().await;
        }
    }
}
