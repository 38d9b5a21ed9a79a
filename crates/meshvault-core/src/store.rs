//! Asset store composition root
//!
//! Opens the store file, brings the schema up to date and wires the
//! transaction manager, cache and health monitor into the repositories. This
//! is the only place those managers are constructed.

use parking_lot::Mutex;
use std::time::Duration;

use meshvault_cache::CacheManager;
use meshvault_health::{HealthMonitor, MonitorHandle};
use meshvault_repository::{
    MetadataRepository, ModelRepository, ProjectRepository, RepositoryContext, SearchRepository,
};
use meshvault_storage::{Database, ErrorHandler, MigrationManager, Transaction, TransactionManager};

use crate::config::Config;
use crate::Result;

pub struct AssetStore {
    config: Config,
    tm: TransactionManager,
    migrations: MigrationManager,
    cache: CacheManager,
    health: HealthMonitor,
    monitor: Mutex<Option<MonitorHandle>>,
    models: ModelRepository,
    metadata: MetadataRepository,
    search: SearchRepository,
    projects: ProjectRepository,
}

impl AssetStore {
    /// Open the store described by `config`.
    ///
    /// Pending migrations are applied before anything else; a migration
    /// failure aborts the open.
    pub fn open(config: Config) -> Result<Self> {
        let db = Database::open_with_timeout(
            &config.database_path,
            Duration::from_millis(config.busy_timeout_ms),
        )?;
        Self::assemble(config, db)
    }

    /// Open a store backed by an in-memory database.
    ///
    /// `config.database_path` is ignored.
    pub fn open_in_memory(config: Config) -> Result<Self> {
        let db = Database::open_in_memory()?;
        Self::assemble(config, db)
    }

    fn assemble(config: Config, db: Database) -> Result<Self> {
        let handler = ErrorHandler::new(db.clone(), config.retry.clone());
        let tm = TransactionManager::new(db, handler);

        let migrations = MigrationManager::builtin(tm.clone())?;
        let version = migrations.apply_migrations(None).map_err(|e| {
            tracing::error!(error = %e, "Schema migration failed");
            e
        })?;

        let cache = CacheManager::new(config.cache.clone())?;
        let health = HealthMonitor::new(config.health.clone(), tm.clone(), cache.clone());
        let monitor = if config.start_monitor {
            Some(health.start()?)
        } else {
            None
        };

        let ctx = RepositoryContext::new(tm.clone(), cache.clone(), health.clone());

        tracing::info!(
            path = ?tm.database().path(),
            schema_version = version,
            monitor = config.start_monitor,
            "Asset store ready"
        );

        Ok(Self {
            config,
            tm,
            migrations,
            cache,
            health,
            monitor: Mutex::new(monitor),
            models: ModelRepository::new(ctx.clone()),
            metadata: MetadataRepository::new(ctx.clone()),
            search: SearchRepository::new(ctx.clone()),
            projects: ProjectRepository::new(ctx),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn models(&self) -> &ModelRepository {
        &self.models
    }

    pub fn metadata(&self) -> &MetadataRepository {
        &self.metadata
    }

    pub fn search(&self) -> &SearchRepository {
        &self.search
    }

    pub fn projects(&self) -> &ProjectRepository {
        &self.projects
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.tm
    }

    pub fn migrations(&self) -> &MigrationManager {
        &self.migrations
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Run `body` as one atomic unit.
    ///
    /// Repository calls made inside `body` join this transaction, so either
    /// all of their writes land or none do.
    pub fn transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> meshvault_repository::Result<T>,
    {
        Ok(self.tm.transaction(body)?)
    }

    /// Stop the health monitor, wait for open transactions and close the
    /// store file
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        if let Some(handle) = self.monitor.lock().take() {
            handle.stop();
        }
        self.tm.shutdown(timeout)?;
        tracing::info!("Asset store shut down");
        Ok(())
    }
}
