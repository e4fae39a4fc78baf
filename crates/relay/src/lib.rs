// Collaborative document relay.
//
// Clients connect over WebSocket to `/<document name>` and speak the y-sync
// protocol. The relay keeps one CRDT document per name in memory while at
// least one client is connected, fans updates and awareness out to every
// connection, and persists documents through pluggable stores.

pub mod app;
pub mod config;
pub mod metrics;
pub mod persist;
pub mod sync;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::RelayConfig;
use crate::persist::{ContentStore, PersistenceAdapter, SqliteStore};
use crate::sync::{RegistryOptions, SessionOptions, SessionRegistry};
use crate::ws::ConnectionSettings;

/// Build the session registry described by `config`.
///
/// With a database path, document state and content go to SQLite; otherwise
/// documents live only as long as their sessions.
pub fn build_registry(config: &RelayConfig) -> Result<Arc<SessionRegistry>> {
    let options = RegistryOptions {
        session: SessionOptions { gc: config.gc },
        persist: config.persist.clone(),
    };
    let registry = SessionRegistry::new(options);

    let registry = match &config.db_path {
        Some(path) => {
            let store = Arc::new(SqliteStore::open(path)?);
            info!(db_path = %path.display(), "persisting documents to sqlite");
            let adapter: Arc<dyn PersistenceAdapter> = store.clone();
            let content: Arc<dyn ContentStore> = store;
            registry.with_persistence(adapter).with_content_store(content)
        }
        None => {
            info!("no database configured; documents are not persisted");
            registry
        }
    };

    Ok(Arc::new(registry))
}

/// Serve the relay on `listener` until `shutdown` resolves, then write the
/// state of every live session.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    settings: ConnectionSettings,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = app::build_router(Arc::clone(&registry), settings);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server exited unexpectedly")?;

    registry.flush_all().await;
    Ok(())
}
