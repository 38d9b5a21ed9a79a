//! Repository error types

use meshvault_storage::{AsStorageError, ErrorKind, StorageError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },

    #[error("Model not found: {0}")]
    MissingModel(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Index rebuild cancelled after {indexed} models")]
    Cancelled { indexed: usize },

    #[error("{operation} failed for '{id}': {source}")]
    Storage {
        operation: &'static str,
        id: String,
        #[source]
        source: StorageError,
    },

    #[error("Storage error: {0}")]
    Store(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RepositoryError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        RepositoryError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Attach the failing operation and identifier to a bare storage error
    pub(crate) fn context(self, operation: &'static str, id: &str) -> Self {
        match self {
            RepositoryError::Store(source) => RepositoryError::Storage {
                operation,
                id: id.to_string(),
                source,
            },
            other => other,
        }
    }

    /// Kind of the underlying store failure, if any
    pub fn storage_kind(&self) -> Option<ErrorKind> {
        self.as_storage_error().map(StorageError::kind)
    }
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(e: rusqlite::Error) -> Self {
        RepositoryError::Store(StorageError::from(e))
    }
}

impl AsStorageError for RepositoryError {
    fn as_storage_error(&self) -> Option<&StorageError> {
        match self {
            RepositoryError::Store(e) | RepositoryError::Storage { source: e, .. } => Some(e),
            _ => None,
        }
    }
}
