//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] meshvault_storage::StorageError),

    #[error("Migration error: {0}")]
    Migration(#[from] meshvault_storage::MigrationError),

    #[error("Cache error: {0}")]
    Cache(#[from] meshvault_cache::CacheError),

    #[error("Health monitor error: {0}")]
    Health(#[from] meshvault_health::HealthError),

    #[error("Repository error: {0}")]
    Repository(#[from] meshvault_repository::RepositoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
