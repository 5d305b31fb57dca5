use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sql_agent_backend::api::handlers::AppState;
use sql_agent_backend::api::routes::create_router;
use sql_agent_backend::config::{Config, LoggingConfig};
use sql_agent_backend::{DatabaseConnector, Query, RateLimiter, ResponseCache};

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG directives win over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match logging.style.as_str() {
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config.logging);

    let db_type = config.database_type()?;
    info!(
        "Starting server on {} with {} backend",
        config.server_address(),
        db_type.display_name()
    );

    let connector = Arc::new(
        DatabaseConnector::connect(
            db_type,
            &config.database.url,
            config.pool_config(),
            config.connector_options(),
        )
        .context("Failed to configure database connector")?,
    );

    let response_cache = Arc::new(ResponseCache::<Query>::new(
        config.cache.max_entries,
        Duration::from_secs(config.cache.default_ttl_secs),
        Duration::from_secs(config.cache.cleanup_interval_secs),
    ));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));

    let state = AppState::new(connector.clone(), response_cache, rate_limiter);
    let app = create_router(state);

    let addr: SocketAddr = config.server_address().parse()?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let closed = connector.close();
    info!("Closed {} pooled connections", closed);
    Ok(())
}
