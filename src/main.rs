use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::signal;
use tracing::info;

use ruleprov::api::routes::{create_router, AppState};
use ruleprov::config::Config;
use ruleprov::observability::{init_tracing, MetricsRegistry};
use ruleprov::provisioning::{AlertRuleProvisioning, RuleProvisioningService};
use ruleprov::storage::{MemoryStore, PostgresStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration
    let config = Config::parse();
    config.validate()?;

    // Initialize tracing
    init_tracing(&config.log_level, config.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        default_interval_secs = config.default_interval_secs,
        base_interval_secs = config.base_interval_secs,
        "Starting ruleprov provisioning service"
    );

    let service = build_service(&config).await?;

    // Create application state
    let state = Arc::new(AppState {
        service,
        metrics: Arc::new(MetricsRegistry::new()),
        start_time: Instant::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });

    // Create router
    let app = create_router(state);

    // Parse listen address
    let addr: SocketAddr = config.listen_addr.parse()?;

    info!(addr = %addr, "Starting HTTP server");

    // Create TCP listener
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run server with graceful shutdown
    if config.graceful_shutdown {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        axum::serve(listener, app).await?;
    }

    info!("Shutdown complete");
    Ok(())
}

/// Build the provisioning service over the configured backend.
async fn build_service(config: &Config) -> anyhow::Result<Arc<dyn AlertRuleProvisioning>> {
    let Some(ref database_url) = config.database_url else {
        info!("Using in-memory storage (no database configured)");
        let store = MemoryStore::new();
        return Ok(Arc::new(RuleProvisioningService::new(
            store.clone(),
            store.clone(),
            store,
            config.default_interval_secs,
            config.base_interval_secs,
        )));
    };

    let store = PostgresStore::connect(
        database_url,
        config.db_min_connections,
        config.db_max_connections,
    )
    .await?;
    store.run_migrations().await?;
    info!("Connected to PostgreSQL, migrations applied");

    Ok(Arc::new(RuleProvisioningService::new(
        store.clone(),
        store.clone(),
        store,
        config.default_interval_secs,
        config.base_interval_secs,
    )))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
