//! Builds the [`Services`] context from configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;

use autotown_core::Services;

use crate::config::Config;
use crate::db;
use crate::notify::LogNotifier;
use crate::sqlite_cache::SqliteCache;
use crate::sqlite_queue::SqliteQueue;
use crate::sqlite_store::SqliteStore;

/// SQLite-backed context plus the pool it runs on.
pub struct App {
    pub services: Services,
    pub pool: SqlitePool,
    pub store: SqliteStore,
    pub queue: SqliteQueue,
}

impl App {
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        Ok(Self::from_pool(config, pool))
    }

    pub fn from_pool(config: &Config, pool: SqlitePool) -> Self {
        let store = SqliteStore::new(pool.clone());
        let queue = SqliteQueue::new(pool.clone())
            .with_lease(Duration::from_secs(config.worker.lease_secs));
        let services = Services::new(
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            Arc::new(SqliteCache::new(pool.clone())),
            Arc::new(LogNotifier),
        )
        .with_settings(config.batch_settings())
        .with_queues(config.queue_names())
        .with_aliases(config.alias_table());
        Self {
            services,
            pool,
            store,
            queue,
        }
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
