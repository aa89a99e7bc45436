//! Process-wide broker connection owning the shared exchange

use crate::{Broker, BrokerConfig, BusResult, NatsBroker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// One logical connection + channel to the broker
///
/// Publishers and consumers in the same process share a single
/// `BrokerConnection` (behind an `Arc`) to avoid exhausting broker
/// connections. The exchange is declared once per connection, on open.
///
/// # Example
/// ```rust,no_run
/// use contact_bus::{BrokerConfig, BrokerConnection};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let connection = BrokerConnection::connect(&BrokerConfig::from_env()?).await?;
/// assert!(connection.is_open());
/// connection.close().await;
/// # Ok(())
/// # }
/// ```
pub struct BrokerConnection {
    broker: Arc<dyn Broker>,
    exchange: String,
    exchange_declared: OnceCell<()>,
    closed: AtomicBool,
}

impl BrokerConnection {
    /// Connect to the configured NATS JetStream server and declare the exchange
    ///
    /// # Errors
    /// `BusError::ConnectionError` if the broker is unreachable or the
    /// exchange cannot be declared. There is no retry loop here; callers that
    /// want one own it.
    pub async fn connect(config: &BrokerConfig) -> BusResult<Self> {
        let broker = NatsBroker::connect(config).await?;
        Self::open(Arc::new(broker), &config.exchange).await
    }

    /// Wrap an already-connected transport and declare the exchange on it
    pub async fn open(broker: Arc<dyn Broker>, exchange: &str) -> BusResult<Self> {
        let connection = Self {
            broker,
            exchange: exchange.to_string(),
            exchange_declared: OnceCell::new(),
            closed: AtomicBool::new(false),
        };

        if let Err(e) = connection.ensure_exchange().await {
            tracing::error!(exchange = %exchange, error = %e, "Failed to declare exchange");
            connection.close().await;
            return Err(e);
        }

        tracing::info!(exchange = %exchange, "Broker connection open");
        Ok(connection)
    }

    async fn ensure_exchange(&self) -> BusResult<()> {
        self.exchange_declared
            .get_or_try_init(|| async { self.broker.declare_exchange(&self.exchange).await })
            .await
            .map(|_| ())
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// True only while neither side has closed the connection or channel
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.broker.is_open()
    }

    /// Close channel then connection. Safe to call any number of times;
    /// teardown failures are logged, not returned.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.broker.close().await {
            Ok(()) => tracing::info!(exchange = %self.exchange, "Broker connection closed"),
            Err(e) => tracing::error!(
                exchange = %self.exchange,
                error = %e,
                "Error while closing broker connection"
            ),
        }
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("exchange", &self.exchange)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;

    #[tokio::test]
    async fn test_open_declares_exchange() {
        let broker = Arc::new(InMemoryBroker::new());
        let connection = BrokerConnection::open(broker.clone(), "contact_events")
            .await
            .unwrap();

        assert!(connection.is_open());
        assert!(broker.has_exchange("contact_events"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = Arc::new(InMemoryBroker::new());
        let connection = BrokerConnection::open(broker.clone(), "contact_events")
            .await
            .unwrap();

        connection.close().await;
        connection.close().await;

        assert!(!connection.is_open());
        assert!(!broker.is_open());
    }

    #[tokio::test]
    async fn test_is_open_tracks_broker_side_disconnect() {
        let broker = Arc::new(InMemoryBroker::new());
        let connection = BrokerConnection::open(broker.clone(), "contact_events")
            .await
            .unwrap();

        broker.disconnect();
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn test_open_fails_on_closed_broker() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.disconnect();

        let result = BrokerConnection::open(broker, "contact_events").await;
        assert!(matches!(result, Err(crate::BusError::ConnectionError(_))));
    }

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream on BROKER_HOST:BROKER_PORT
    async fn test_connect_to_nats() {
        let config = BrokerConfig::from_env().unwrap();
        let connection = BrokerConnection::connect(&config).await.unwrap();
        assert!(connection.is_open());
        connection.close().await;
        assert!(!connection.is_open());
    }
}
