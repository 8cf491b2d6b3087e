use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use parley_db::Database;
use parley_gateway::tasks;
use parley_server::config::ServerConfig;
use parley_server::{ServerState, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let db = Arc::new(Database::open(&config.db_path)?);
    let state = ServerState::new(db, &config);

    // Background tasks
    let shutdown = CancellationToken::new();
    let presence_window = chrono::Duration::from_std(config.presence_timeout)?;
    tokio::spawn(tasks::run_presence_sweeper(
        state.gateway.stores.presence.clone(),
        presence_window,
        config.sweep_interval,
        shutdown.clone(),
    ));

    let app = build_router(state);

    let addr = config.bind_addr()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            signal.cancel();
        })
        .await?;

    Ok(())
}
