use contact_bus::{
    BrokerConfig, BrokerConnection, Consumer, ConsumerOptions, EventHandler, EventKind,
    HandlerRegistry,
};
use contacts::{ConsumerSettings, ContactDirectory};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,contact_bus=debug,contacts=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = BrokerConfig::from_env()?;
    let settings = ConsumerSettings::from_env()?;

    // Broker (fail-fast)
    let connection = Arc::new(BrokerConnection::connect(&config).await?);

    let directory = Arc::new(ContactDirectory::new());
    let registry = HandlerRegistry::new()
        .with(EventKind::Created, directory.clone())
        .with(EventKind::Updated, directory.clone())
        .with(EventKind::Deleted, directory.clone());
    let handler: Arc<dyn EventHandler> = Arc::new(registry);

    let consumer = Consumer::with_options(
        connection,
        ConsumerOptions {
            shutdown_grace: settings.shutdown_grace,
        },
    );
    let consumer_tag = consumer
        .start_consuming(handler, settings.queue.as_deref(), Some(&settings.binding))
        .await?;

    tracing::info!(
        exchange = %config.exchange,
        consumer_tag = %consumer_tag,
        binding = %settings.binding,
        "Contacts consumer running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    consumer.close().await;
    tracing::info!(contacts = directory.len().await, "Contacts consumer stopped");
    Ok(())
}
