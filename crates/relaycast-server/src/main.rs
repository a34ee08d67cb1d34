//! Relaycast - delivery server entry point

use anyhow::{Context, Result};
use relaycast_api::{create_router, AppState};
use relaycast_common::config::{Config, LoggingConfig};
use relaycast_core::{build_registry, DeliveryMetrics, MaintenanceJob};
use relaycast_storage::db::DatabasePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_logging(&config.logging);

    info!("Starting Relaycast delivery server...");

    let db_pool = DatabasePool::new(&config.database).await?;
    db_pool.migrate().await?;

    let registry = build_registry(&config.providers)?;
    info!(providers = ?registry.list(), "Providers registered");

    let metrics = DeliveryMetrics::new()?;
    let state = Arc::new(AppState::build(
        db_pool.clone(),
        &config,
        registry,
        metrics,
    ));

    let shutdown = CancellationToken::new();

    // Start delivery worker
    let worker_handle = {
        let worker = state.worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            worker.run(shutdown).await;
        })
    };

    // Start midnight maintenance
    let maintenance_handle = {
        let job = MaintenanceJob::new(state.frequency.clone(), state.rate_limiter.clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            job.run(shutdown).await;
        })
    };

    // Start API server
    let bind = format!("{}:{}", config.server.bind_address, config.api.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind API server to {}", bind))?;
    info!(address = %bind, "Starting API server");

    let app = create_router(state);
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await });
        if let Err(e) = serve.await {
            error!(error = %e, "API server error");
        }
    });

    info!("Relaycast server started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    for (name, handle) in [
        ("delivery worker", worker_handle),
        ("maintenance", maintenance_handle),
        ("api", api_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task ended abnormally");
        }
    }

    info!("Relaycast server shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},relaycast=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
