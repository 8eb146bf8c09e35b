//! API server entry point.

use std::sync::Arc;

use api::config::Config;
use api::{Backend, build, create_app, spawn_background, telemetry};
use common::{Clock, SystemClock};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    telemetry::init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = match config.database_url.as_deref() {
        Some(url) => Backend::postgres(url)
            .await
            .expect("failed to prepare PostgreSQL backend"),
        None => {
            tracing::warn!("DATABASE_URL not set, state is kept in memory only");
            Backend::in_memory(clock.clone())
        }
    };

    let services = build(&config, backend, clock);
    let shutdown = CancellationToken::new();
    let tasks = spawn_background(&services, &config, shutdown.clone())
        .expect("failed to start background tasks");

    let app = create_app(services.state.clone(), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "background task ended abnormally");
        }
    }

    tracing::info!("server shut down gracefully");
}
