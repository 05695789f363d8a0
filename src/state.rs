//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::entities::SqliteEntityStore;
use crate::sync::SyncCoordinator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    sync: SyncCoordinator,
}

impl AppState {
    /// Create the application state over the SQLite entity store
    pub fn new(config: Config, db: SqlitePool) -> Self {
        let entities = Arc::new(SqliteEntityStore::new(db.clone()));
        let sync = SyncCoordinator::new(db.clone(), entities, config.sync.clone());

        Self {
            inner: Arc::new(AppStateInner { config, db, sync }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the sync engine
    pub fn sync(&self) -> &SyncCoordinator {
        &self.inner.sync
    }
}
