use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use outbox_bus::config::Settings;
use outbox_bus::domain::customer::{
    Address, CustomerAddressAdded, CustomerCreated, CustomerRepository, Email, NewCustomer,
};
use outbox_bus::events::EventPayload;
use outbox_bus::messaging::{EventBus, HandlerContext, MessageBroker, RedpandaBroker};
use outbox_bus::metrics::{self, HealthRegistry, Metrics};
use outbox_bus::outbox::{OutboxRelay, PgOutboxStore};
use outbox_bus::service::{EventDrivenService, Service};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,outbox_bus=debug"))
        )
        .init();

    tracing::info!("🚀 Starting transactional outbox demo");

    let settings = Settings::load()?;

    // === 1. Metrics and health endpoints ===
    let metrics = Arc::new(Metrics::new()?);
    let health = HealthRegistry::new();
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // actix-web runs on its own system in a background thread
    let registry = metrics.registry().clone();
    let server_health = health.clone();
    let metrics_port = settings.metrics_port;
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(metrics::start_metrics_server(registry, server_health, metrics_port)) {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // === 2. PostgreSQL: outbox table and customer tables ===
    tracing::info!("Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.database_url)
        .await?;

    let store = Arc::new(PgOutboxStore::new(pool.clone()));
    store.run_migrations().await?;
    let customers = CustomerRepository::new(pool.clone());
    customers.run_migrations().await?;

    // === 3. Redpanda (with circuit breaker) ===
    let broker: Arc<dyn MessageBroker> =
        Arc::new(RedpandaBroker::new(settings.broker.clone())?.with_metrics(metrics.clone()));

    // === 4. Outbox relay ===
    let relay = Arc::new(
        OutboxRelay::new(store.clone(), broker.clone(), settings.relay.clone()).with_metrics(metrics.clone()),
    );
    health.register(relay.clone());

    // === 5. Event-driven service consuming customer events ===
    let mut bus_config = settings.bus.clone();
    if bus_config.read_topics.is_empty() {
        bus_config.read_topics = vec![bus_config.write_topic.clone()];
    }
    let bus = Arc::new(EventBus::new(broker.clone(), bus_config).with_metrics(metrics.clone()));
    let service = Arc::new(EventDrivenService::new("customer-notifications").with_bus(bus));

    service
        .register_handler_named(
            "welcome_email",
            CustomerCreated::factory(),
            |ctx: HandlerContext, event: CustomerCreated| async move {
                tracing::info!(
                    customer_id = %event.customer_id,
                    email = %event.email.as_str(),
                    event_id = ?ctx.event_id,
                    "📧 Sending welcome email"
                );
                Ok::<(), anyhow::Error>(())
            },
        )
        .await?;
    service
        .register_handler_named(
            "address_book",
            CustomerAddressAdded::factory(),
            |_ctx: HandlerContext, event: CustomerAddressAdded| async move {
                tracing::info!(
                    customer_id = %event.customer_id,
                    address_id = %event.address_id,
                    city = %event.address.city,
                    "🏠 Address book updated"
                );
                Ok::<(), anyhow::Error>(())
            },
        )
        .await?;
    health.register(service.clone());
    tracing::info!(handlers = service.handler_count().await, "Handlers registered");

    let shutdown = CancellationToken::new();

    let relay_task = tokio::spawn({
        let relay = relay.clone();
        let shutdown = shutdown.clone();
        async move { relay.run(shutdown).await }
    });

    let service_task = tokio::spawn({
        let service = service.clone();
        let shutdown = shutdown.clone();
        async move { service.start(shutdown).await }
    });

    // === 6. Demo: domain writes that emit events through the outbox ===
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let email = Email::parse(format!("ada+{}@example.com", &suffix[..8]))
        .ok_or_else(|| anyhow::anyhow!("demo email is invalid"))?;
    let customer_id = customers
        .create_customer(NewCustomer {
            email,
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
        })
        .await?;
    customers
        .add_address(
            customer_id,
            Address {
                street: "12 St James's Square".into(),
                city: "London".into(),
                state: "Greater London".into(),
                postal_code: "SW1Y 4LB".into(),
                country: "GB".into(),
            },
            true,
        )
        .await?;
    tracing::info!(customer_id = %customer_id, "✅ Demo customer written; events will be relayed");

    tracing::info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    shutdown.cancel();

    relay_task.await?;
    if let Err(e) = service_task.await? {
        tracing::error!(error = %e, "Service exited with error");
    }

    tracing::info!("✅ Shutdown complete");
    Ok(())
}
