//! Storage error types
//!
//! Every low-level failure is mapped onto one of five [`ErrorKind`]s. The kind
//! decides whether the recovery layer may retry the operation.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a store failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The handle could not be opened or was lost
    Connection,
    /// A constraint (unique, foreign key, check) rejected the write
    Constraint,
    /// Another writer holds the database lock
    Lock,
    /// Malformed SQL or a reference to a missing schema object
    Syntax,
    /// Corruption or data that cannot be decoded
    Integrity,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::Connection,
        ErrorKind::Constraint,
        ErrorKind::Lock,
        ErrorKind::Syntax,
        ErrorKind::Integrity,
    ];

    /// Returns true if an operation failing with this kind may succeed on retry
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::Connection | ErrorKind::Lock)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Constraint => "constraint",
            ErrorKind::Lock => "lock",
            ErrorKind::Syntax => "syntax",
            ErrorKind::Integrity => "integrity",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "connection" => Ok(ErrorKind::Connection),
            "constraint" => Ok(ErrorKind::Constraint),
            "lock" => Ok(ErrorKind::Lock),
            "syntax" => Ok(ErrorKind::Syntax),
            "integrity" => Ok(ErrorKind::Integrity),
            _ => Err(format!("Unknown error kind: {}", s)),
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to open database at '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Timed out after {waited:?} waiting for the database handle")]
    HandleBusy { waited: Duration },

    #[error("Database still locked after {attempts} attempt(s)")]
    LockTimeout { attempts: u32 },

    #[error("Database handle is closed")]
    Closed,

    #[error("Cannot reconnect while a transaction is open")]
    ReconnectInTransaction,

    #[error("{count} transaction(s) still open at shutdown")]
    OpenTransactions { count: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Map this error onto the storage error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Sqlite(e) => classify_sqlite(e),
            StorageError::Open { .. } => ErrorKind::Connection,
            StorageError::HandleBusy { .. } => ErrorKind::Lock,
            StorageError::LockTimeout { .. } => ErrorKind::Lock,
            StorageError::Closed => ErrorKind::Connection,
            StorageError::ReconnectInTransaction => ErrorKind::Lock,
            StorageError::OpenTransactions { .. } => ErrorKind::Lock,
            StorageError::Io(_) => ErrorKind::Connection,
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    ///
    /// Terminal variants keep their kind but are never retried: a lock
    /// timeout already exhausted its retries and a closed handle was shut
    /// down on purpose.
    pub fn is_recoverable(&self) -> bool {
        match self {
            StorageError::LockTimeout { .. }
            | StorageError::Closed
            | StorageError::ReconnectInTransaction
            | StorageError::OpenTransactions { .. } => false,
            other => other.kind().is_recoverable(),
        }
    }
}

/// Classify a rusqlite error by its SQLite result code
pub fn classify_sqlite(error: &rusqlite::Error) -> ErrorKind {
    use rusqlite::Error as E;

    if let Some(code) = error.sqlite_error_code() {
        return classify_code(code);
    }

    match error {
        E::SqliteSingleThreadedMode | E::InvalidPath(_) => ErrorKind::Connection,
        // Stored data that cannot be read back as the expected type
        E::FromSqlConversionFailure(..)
        | E::IntegralValueOutOfRange(..)
        | E::InvalidColumnType(..)
        | E::Utf8Error(_) => ErrorKind::Integrity,
        // Prepare failures carry the offending SQL and no extended code
        E::SqlInputError { .. } => ErrorKind::Syntax,
        E::InvalidQuery
        | E::MultipleStatement
        | E::InvalidParameterName(_)
        | E::InvalidParameterCount(..)
        | E::ExecuteReturnedResults
        | E::InvalidColumnName(_)
        | E::InvalidColumnIndex(_)
        | E::StatementChangedRows(_) => ErrorKind::Syntax,
        // Remaining variants are misuse of the statement API; never retried
        _ => ErrorKind::Syntax,
    }
}

fn classify_code(code: ErrorCode) -> ErrorKind {
    match code {
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorKind::Lock,
        ErrorCode::CannotOpen
        | ErrorCode::SystemIoFailure
        | ErrorCode::PermissionDenied
        | ErrorCode::ReadOnly
        | ErrorCode::DiskFull
        | ErrorCode::FileLockingProtocolFailed
        | ErrorCode::NoLargeFileSupport
        | ErrorCode::NotFound => ErrorKind::Connection,
        ErrorCode::ConstraintViolation => ErrorKind::Constraint,
        ErrorCode::DatabaseCorrupt
        | ErrorCode::NotADatabase
        | ErrorCode::TypeMismatch
        | ErrorCode::TooBig => ErrorKind::Integrity,
        _ => ErrorKind::Syntax,
    }
}

/// Access to the storage failure carried by a higher-level error.
///
/// The transaction manager uses this to decide whether a failed body is worth
/// retrying without knowing the caller's error type.
pub trait AsStorageError {
    fn as_storage_error(&self) -> Option<&StorageError>;
}

impl AsStorageError for StorageError {
    fn as_storage_error(&self) -> Option<&StorageError> {
        Some(self)
    }
}

#[cfg(test)]
pub(crate) fn sqlite_failure(code: std::os::raw::c_int, message: &str) -> StorageError {
    StorageError::Sqlite(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(code),
        Some(message.to_string()),
    ))
}
