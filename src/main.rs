use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use easyearn_ledger::{AppState, Config, KvStore, Ledger, MemoryStore, PgStore, init_router};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    if config.admin_token.is_empty() {
        warn!("ADMIN_TOKEN is not set; admin routes will reject every request");
    }

    let store: Arc<dyn KvStore> = match config.database_url.as_deref() {
        Some(url) => Arc::new(PgStore::connect(url).await?),
        None => {
            warn!("DATABASE_URL is not set; ledger state lives in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let ledger = Ledger::open(store, config.ledger_settings())
        .await
        .context("Failed to open ledger")?;

    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = TcpListener::bind(addr).await?;
    let app = init_router(AppState::new(ledger, config));

    info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
