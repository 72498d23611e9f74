use std::sync::Arc;

use tracing::info;

use crate::{
    auth::SessionStore,
    config::{Config, IN_MEMORY},
    qr::{QrRenderer, StandardRenderer},
    store::{ContactStore, MemoryStore, SqliteStore, StoreError},
};

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ContactStore>,
    pub sessions: SessionStore,
    pub renderer: Arc<dyn QrRenderer>,
}

impl AppState {
    /// Opens the store selected by `config.database`.
    pub async fn new(config: Config) -> Result<Arc<Self>, StoreError> {
        let store: Arc<dyn ContactStore> = if config.database == IN_MEMORY {
            info!("Using in-memory store, data will not survive a restart");
            Arc::new(MemoryStore::new())
        } else {
            info!("Opening SQLite store at {}", config.database);
            Arc::new(SqliteStore::open(&config.database).await?)
        };

        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Arc<dyn ContactStore>) -> Arc<Self> {
        Self::with_parts(config, store, Arc::new(StandardRenderer))
    }

    pub fn with_parts(
        config: Config,
        store: Arc<dyn ContactStore>,
        renderer: Arc<dyn QrRenderer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: SessionStore::new(config.session_ttl),
            config,
            store,
            renderer,
        })
    }
}
