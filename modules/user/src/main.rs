use event_bus::{
    ConsumerConfig, InMemoryQueue, JetStreamQueue, MemoryStore, OutboxConfig, OutboxCoordinator,
    PgStore, ProcessedPurger, Publisher, QueueRoutes, QueueTransport, Stores,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use user_rs::config::{BusType, Config, StoreType};
use user_rs::consumer::default_consumer_config;
use user_rs::start_user_consumer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,user_rs=debug".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;
    tracing::info!(bus_type = ?config.bus_type, store_type = ?config.store_type, "Starting user service");

    let transport: Arc<dyn QueueTransport> = match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using in-memory queue transport");
            Arc::new(InMemoryQueue::new())
        }
        BusType::Nats => {
            let nats_url = config.nats_url.as_deref().unwrap_or("nats://localhost:4222");
            tracing::info!(nats_url = %nats_url, "Connecting to NATS JetStream");
            let client = async_nats::connect(nats_url).await?;
            Arc::new(JetStreamQueue::connect(client).await?)
        }
    };

    let stores = match (&config.store_type, &config.database_url) {
        (StoreType::Postgres, Some(database_url)) => {
            tracing::info!("Connecting to database");
            let store = PgStore::connect(database_url).await?;
            store.migrate().await?;
            Stores::postgres(store)
        }
        _ => {
            tracing::info!("Using in-memory store");
            Stores::memory(MemoryStore::new())
        }
    };

    let publisher = Arc::new(Publisher::new(transport.clone(), QueueRoutes::commerce()));
    let outbox_config = OutboxConfig {
        sweep_interval: config.outbox_sweep_interval,
        grace_period: config.outbox_grace_period,
        ..OutboxConfig::default()
    };
    outbox_config.validate()?;
    let outbox = Arc::new(OutboxCoordinator::new(
        stores.outbox.clone(),
        publisher,
        outbox_config,
    ));

    let consumer_config = ConsumerConfig {
        batch_size: config.consumer_batch_size,
        visibility_timeout: config.visibility_timeout,
        max_deliveries: config.max_deliveries,
        heartbeat_interval: config.visibility_timeout / 3,
        handler_timeout: config.visibility_timeout * 4 / 5,
        ..default_consumer_config()
    };
    consumer_config.validate()?;

    let purger = ProcessedPurger::new(
        stores.processed.clone(),
        config.processed_retention,
        config.processed_purge_interval,
        &[&consumer_config],
    )?;

    let (shutdown, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(outbox.run_sweeper(shutdown_rx.clone()));
    let purger = tokio::spawn(purger.run(shutdown_rx));
    let consumer = start_user_consumer(consumer_config, transport, &stores);

    tracing::info!("User service running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    consumer.shutdown().await?;
    let _ = shutdown.send(true);
    sweeper.await?;
    purger.await?;

    tracing::info!("User service stopped");
    Ok(())
}
