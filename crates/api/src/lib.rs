//! HTTP surface and process wiring for the storefront core.
//!
//! [`create_app`] builds the axum router; [`build`] assembles the ledger,
//! state machine and payment coordinator over a [`Backend`];
//! [`spawn_background`] starts the reservation sweeper, the expiry listener
//! and the collaborator forwarders.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use checkout::{
    EvidenceSigner, ExpiryListener, InMemoryCartService, InMemoryPaymentGateway,
    OrderStateMachine, PaymentCoordinator,
};
use common::{Clock, RetryPolicy};
use domain::OrderService;
use event_store::{InMemoryEventStore, PostgresEventStore};
use events::{
    Collaborator, DELIVERY_EVENTS, EventBus, EventPublisher, NOTIFICATION_EVENTS,
    TracingCollaborator, WebhookCollaborator, spawn_forwarder,
};
use inventory::{
    InMemoryLockService, InMemoryStockStore, LockService, PostgresLockService, PostgresStockStore,
    ReservationSweeper, StockLedger, StockStore,
};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use error::StartupError;
use state::{AppState, Journal};

const MAX_DB_CONNECTIONS: u32 = 10;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create))
        .route("/orders/{id}", get(routes::orders::get))
        .route("/orders/{id}/cancel", post(routes::orders::cancel))
        .route("/orders/{id}/refund", post(routes::orders::refund))
        .route("/orders/{id}/payment", post(routes::payments::confirm))
        .route("/webhooks/payment", post(routes::payments::webhook))
        .route("/products/{id}/stock", get(routes::products::stock))
        .route("/products/{id}/restock", post(routes::products::restock))
        .route("/products/{id}/movements", get(routes::products::movements))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Where orders, stock and leases live.
pub struct Backend {
    pub journal: Journal,
    pub lock: Arc<dyn LockService>,
    pub stock: Arc<dyn StockStore>,
}

impl Backend {
    /// Process-local stores. Lease expiry follows `clock`.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            journal: Arc::new(InMemoryEventStore::new()),
            lock: Arc::new(InMemoryLockService::new(clock)),
            stock: Arc::new(InMemoryStockStore::new()),
        }
    }

    /// Connects to PostgreSQL and brings the schema up to date.
    pub async fn postgres(database_url: &str) -> Result<Self, StartupError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_DB_CONNECTIONS)
            .connect(database_url)
            .await?;

        let journal = PostgresEventStore::new(pool.clone());
        journal.run_migrations().await?;
        tracing::info!("database migrations applied");

        Ok(Self {
            journal: Arc::new(journal),
            lock: Arc::new(PostgresLockService::new(pool.clone())),
            stock: Arc::new(PostgresStockStore::new(pool)),
        })
    }
}

/// Everything the process runs, wired together.
pub struct Services {
    pub state: Arc<AppState>,
    pub bus: Arc<EventBus>,
    pub sweeper: Arc<ReservationSweeper>,
    pub gateway: Arc<InMemoryPaymentGateway>,
    pub cart: Arc<InMemoryCartService>,
}

/// Assembles the ledger, state machine and coordinator over `backend`.
///
/// The payment gateway and cart are in-memory stand-ins; the gateway signs
/// with the same secret the coordinator verifies with.
pub fn build(config: &Config, backend: Backend, clock: Arc<dyn Clock>) -> Services {
    let bus = Arc::new(EventBus::default());
    let publisher: Arc<dyn EventPublisher> = bus.clone();

    let ledger = Arc::new(StockLedger::new(
        backend.lock.clone(),
        backend.stock,
        clock.clone(),
        config.ledger_config(),
    ));

    let gateway = Arc::new(InMemoryPaymentGateway::new(
        config.payment_webhook_secret.as_bytes(),
    ));
    let cart = Arc::new(InMemoryCartService::new());

    let machine = Arc::new(OrderStateMachine::new(
        OrderService::with_clock(backend.journal, clock),
        ledger.clone(),
        backend.lock,
        gateway.clone(),
        cart.clone(),
        publisher.clone(),
        config.checkout_config(),
    ));
    let coordinator = PaymentCoordinator::new(
        machine.clone(),
        EvidenceSigner::new(config.payment_webhook_secret.as_bytes()),
    );
    let sweeper = Arc::new(ReservationSweeper::new(
        ledger.clone(),
        publisher,
        config.sweeper_config(),
    ));

    Services {
        state: Arc::new(AppState {
            machine,
            coordinator,
            ledger,
        }),
        bus,
        sweeper,
        gateway,
        cart,
    }
}

/// Starts the sweeper, the expiry listener and one forwarder per
/// collaborator. Every task stops when `shutdown` fires.
pub fn spawn_background(
    services: &Services,
    config: &Config,
    shutdown: CancellationToken,
) -> Result<Vec<JoinHandle<()>>, StartupError> {
    let notification = collaborator(
        "notification",
        config.notification_webhook_url.as_deref(),
        NOTIFICATION_EVENTS,
    )?;
    let delivery = collaborator(
        "delivery",
        config.delivery_webhook_url.as_deref(),
        DELIVERY_EVENTS,
    )?;

    let listener = ExpiryListener::new(services.state.machine.clone());

    Ok(vec![
        listener.spawn(&services.bus, shutdown.clone()),
        spawn_forwarder(&services.bus, notification, shutdown.clone()),
        spawn_forwarder(&services.bus, delivery, shutdown.clone()),
        services.sweeper.clone().spawn(shutdown),
    ])
}

fn collaborator(
    name: &str,
    url: Option<&str>,
    event_types: &'static [&'static str],
) -> Result<Arc<dyn Collaborator>, StartupError> {
    match url {
        Some(url) => {
            let retry = RetryPolicy::new(3, Duration::from_millis(250));
            let webhook = WebhookCollaborator::new(name, url, event_types, retry)?;
            tracing::info!(collaborator = name, %url, "delivering events over HTTP");
            Ok(Arc::new(webhook))
        }
        None => Ok(Arc::new(TracingCollaborator::new(name, event_types))),
    }
}
