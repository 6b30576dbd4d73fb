//! Versioned document API server.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trail_api::server::{self, AppState};
use trail_engine::{Trail, TrailConfig, VersionStore};
use trail_store::InMemoryVersionStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = TrailConfig::from_env();
    let store = open_store()?;
    let trail = Arc::new(Trail::with_config(store, config));
    let app = server::router(Arc::new(AppState::new(trail)));

    let addr: SocketAddr = std::env::var("TRAIL_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:8002".to_string())
        .parse()?;
    tracing::info!("trail API listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .await?;
    Ok(())
}

#[cfg(feature = "sqlite")]
fn open_store() -> Result<Arc<dyn VersionStore>, Box<dyn std::error::Error + Send + Sync>> {
    if let Ok(path) = std::env::var("TRAIL_SQLITE_PATH") {
        tracing::info!(path = %path, "using SQLite version store");
        return Ok(Arc::new(trail_store::SqliteVersionStore::new(path)?));
    }
    Ok(Arc::new(InMemoryVersionStore::new()))
}

#[cfg(not(feature = "sqlite"))]
fn open_store() -> Result<Arc<dyn VersionStore>, Box<dyn std::error::Error + Send + Sync>> {
    if std::env::var("TRAIL_SQLITE_PATH").is_ok() {
        tracing::warn!("TRAIL_SQLITE_PATH is set but the sqlite feature is off; versions are kept in memory");
    }
    Ok(Arc::new(InMemoryVersionStore::new()))
}
