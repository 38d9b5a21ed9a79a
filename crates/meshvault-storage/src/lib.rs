//! meshvault Storage Layer
//!
//! SQLite-based persistence for the asset library.
//! All writes go through [`TransactionManager`] scopes; schema changes go
//! through [`MigrationManager`].

mod cancel;
mod database;
mod error;
mod migrations;
mod recovery;
mod transaction;

pub use cancel::CancelToken;
pub use database::Database;
pub use error::{classify_sqlite, AsStorageError, ErrorKind, StorageError};
pub use migrations::{
    builtin_migrations, Direction, Migration, MigrationError, MigrationManager, MigrationRecord,
    MigrationResult,
};
pub use recovery::{
    Classification, ErrorHandler, RecoveryAction, RecoveryEvent, RecoveryStats, RetryPolicy,
};
pub use transaction::{Behavior, PreCommitHook, Transaction, TransactionManager, TransactionStats};

/// Re-exported so callers can write statements against [`Transaction::conn`]
pub use rusqlite;

pub type Result<T> = std::result::Result<T, StorageError>;
