//! meshvault Core
//!
//! Configuration, logging bootstrap and the [`AssetStore`] that wires the
//! storage, cache, health and repository layers together.

mod config;
mod error;
mod store;

pub use config::Config;
pub use error::CoreError;
pub use store::AssetStore;

// Re-export the layers callers work with
pub use meshvault_cache::{CacheConfig, CacheManager, CacheStats};
pub use meshvault_health::{HealthConfig, HealthMonitor, HealthReport, HealthStatus};
pub use meshvault_repository::{
    DuplicateGroup, ListOptions, ListOrder, MetadataEntry, MetadataValue, MetadataRepository,
    ModelRecord, ModelRepository, ModelUpdate, NewModel, NewProject, Project, ProjectRepository,
    ProjectUpdate, RepositoryError, SearchHit, SearchQuery, SearchRepository,
};
pub use meshvault_storage::{
    CancelToken, MigrationManager, RetryPolicy, StorageError, Transaction, TransactionManager,
};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
