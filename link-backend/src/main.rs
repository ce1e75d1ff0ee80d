//! Stealth Link backend server

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stealth_link_backend::{app, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stealth_link_backend=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    info!(port = config.port, "Starting Stealth Link backend");
    info!(
        rpc_configured = config.rpc_url.is_some(),
        indexer_url_set = config.indexer_url.is_some(),
        registry_program = %config.registry_program_id,
        "Configuration loaded"
    );

    let addr = format!("0.0.0.0:{}", config.port);
    let state = AppState::from_config(config);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app(state)).await?;
    Ok(())
}
