//! Shared plumbing for the repositories
//!
//! Every repository call goes through a [`RepositoryContext`]: store access is
//! wrapped in a transaction (joining the caller's when one is open), timed for
//! the health monitor, and reads go through the cache.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use meshvault_cache::{CacheManager, LoadTicket};
use meshvault_health::HealthMonitor;
use meshvault_storage::{Transaction, TransactionManager};

use crate::Result;

pub struct RepositoryContext {
    tm: TransactionManager,
    cache: CacheManager,
    health: HealthMonitor,
}

impl RepositoryContext {
    pub fn new(tm: TransactionManager, cache: CacheManager, health: HealthMonitor) -> Self {
        Self { tm, cache, health }
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.tm
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Run `body` in a write transaction
    pub(crate) fn write<T, F>(&self, site: &str, body: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        self.timed(site, || self.tm.transaction(body))
    }

    /// Run `body` in a read transaction
    pub(crate) fn read<T, F>(&self, site: &str, body: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        self.timed(site, || self.tm.read(body))
    }

    /// Read through the cache.
    ///
    /// Values are only published when loaded by an outermost scope, so data
    /// from a transaction that may still roll back never reaches the cache.
    pub(crate) fn cached<T, F>(&self, site: &str, key: &str, mut body: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&Transaction<'_>) -> Result<Option<T>>,
    {
        if let Some(bytes) = self.cache.get(key) {
            match serde_json::from_slice(&bytes) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Discarding undecodable cache entry");
                    self.cache.invalidate(key);
                }
            }
        }

        let ticket = self.cache.load_ticket();
        let (value, outermost) = self.read(site, |tx| Ok((body(tx)?, tx.is_outermost())))?;

        if outermost {
            if let Some(value) = &value {
                self.publish(ticket, key, value);
            }
        }
        Ok(value)
    }

    /// Drop cached entries under `prefixes` now and again once the
    /// outermost transaction finishes
    pub(crate) fn invalidate_on_write(&self, tx: &Transaction<'_>, prefixes: Vec<String>) {
        for prefix in &prefixes {
            self.cache.invalidate_prefix(prefix);
        }

        let cache = self.cache.clone();
        tx.on_finish(move || {
            for prefix in &prefixes {
                cache.invalidate_prefix(prefix);
            }
        });
    }

    fn publish<T: Serialize>(&self, ticket: LoadTicket, key: &str, value: &T) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self.cache.put_if_fresh(ticket, key, Arc::from(bytes)) {
            tracing::warn!(key, error = %e, "Failed to cache value");
        }
    }

    fn timed<T>(&self, site: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let result = f();
        self.health.record_query(site, started.elapsed(), result.is_ok());
        result
    }
}

impl Clone for RepositoryContext {
    fn clone(&self) -> Self {
        Self {
            tm: self.tm.clone(),
            cache: self.cache.clone(),
            health: self.health.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use meshvault_cache::CacheConfig;
    use meshvault_health::HealthConfig;
    use meshvault_storage::{Database, ErrorHandler, MigrationManager, RetryPolicy};

    /// Fully migrated in-memory store
    pub(crate) fn context() -> RepositoryContext {
        let db = Database::open_in_memory().unwrap();
        let handler = ErrorHandler::new(
            db.clone(),
            RetryPolicy {
                base_delay_ms: 1,
                max_delay_ms: 4,
                ..RetryPolicy::default()
            },
        );
        let tm = TransactionManager::new(db, handler);
        MigrationManager::builtin(tm.clone())
            .unwrap()
            .apply_migrations(None)
            .unwrap();

        let cache = CacheManager::new(CacheConfig::default()).unwrap();
        let health = HealthMonitor::new(HealthConfig::default(), tm.clone(), cache.clone());
        RepositoryContext::new(tm, cache, health)
    }
}
