//! Database connection handle
//!
//! The store is one SQLite file owned by a single [`Connection`]. The
//! connection lives behind a re-entrant lock so that a thread already inside a
//! transaction can open nested scopes, while other threads wait (bounded) for
//! the outermost scope to finish.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use rusqlite::Connection;
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StorageError;
use crate::Result;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Callback run once the outermost transaction has committed or rolled back
pub(crate) type FinishHook = Box<dyn FnOnce() + Send>;

/// State guarded by the handle lock
pub(crate) struct Handle {
    pub(crate) conn: RefCell<Option<Connection>>,
    /// Nesting depth of the transaction currently open on this handle
    pub(crate) depth: Cell<usize>,
    pub(crate) finish_hooks: RefCell<Vec<FinishHook>>,
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

struct DatabaseInner {
    handle: ReentrantMutex<Handle>,
    location: Location,
    busy_timeout: Duration,
    reconnects: AtomicU64,
}

pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open a file database, waiting at most `busy_timeout` inside SQLite
    /// before a statement reports `SQLITE_BUSY`
    pub fn open_with_timeout<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let location = Location::File(path);
        let conn = connect(&location, busy_timeout)?;

        tracing::info!(path = ?location_path(&location), "Opened database");

        Ok(Self::from_connection(conn, location, busy_timeout))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = connect(&Location::Memory, DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self::from_connection(
            conn,
            Location::Memory,
            DEFAULT_BUSY_TIMEOUT,
        ))
    }

    fn from_connection(conn: Connection, location: Location, busy_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                handle: ReentrantMutex::new(Handle {
                    conn: RefCell::new(Some(conn)),
                    depth: Cell::new(0),
                    finish_hooks: RefCell::new(Vec::new()),
                }),
                location,
                busy_timeout,
                reconnects: AtomicU64::new(0),
            }),
        }
    }

    /// Path of the store file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        location_path(&self.inner.location)
    }

    /// Run `f` against the connection outside of any explicit transaction
    pub fn with_connection<F, T>(&self, wait: Duration, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self.acquire(wait)?;
        let conn = guard.conn.borrow();
        let conn = conn.as_ref().ok_or(StorageError::Closed)?;
        f(conn)
    }

    /// Acquire the handle lock, waiting at most `wait`
    pub(crate) fn acquire(&self, wait: Duration) -> Result<ReentrantMutexGuard<'_, Handle>> {
        self.inner
            .handle
            .try_lock_for(wait)
            .ok_or(StorageError::HandleBusy { waited: wait })
    }

    /// Replace the connection with a freshly opened one.
    ///
    /// Returns `Ok(false)` when the store cannot be reopened without losing
    /// data (in-memory databases) or was closed on purpose.
    pub fn reconnect(&self, wait: Duration) -> Result<bool> {
        let guard = self.acquire(wait)?;
        if guard.depth.get() > 0 {
            return Err(StorageError::ReconnectInTransaction);
        }

        if matches!(self.inner.location, Location::Memory) {
            return Ok(false);
        }

        let mut slot = guard
            .conn
            .try_borrow_mut()
            .map_err(|_| StorageError::ReconnectInTransaction)?;
        if slot.is_none() {
            return Ok(false);
        }

        let conn = connect(&self.inner.location, self.inner.busy_timeout)?;
        *slot = Some(conn);
        self.inner.reconnects.fetch_add(1, Ordering::Relaxed);

        tracing::warn!(path = ?self.path(), "Reconnected database handle");

        Ok(true)
    }

    /// Close the handle. Later operations fail with [`StorageError::Closed`].
    pub(crate) fn close(&self, wait: Duration) -> Result<()> {
        let guard = self.acquire(wait)?;
        if guard.depth.get() > 0 {
            return Err(StorageError::OpenTransactions { count: 1 });
        }

        let conn = guard
            .conn
            .try_borrow_mut()
            .map_err(|_| StorageError::OpenTransactions { count: 1 })?
            .take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
            tracing::info!(path = ?self.path(), "Closed database");
        }
        Ok(())
    }

    /// Number of live connections held by this handle (0 or 1)
    pub fn open_connections(&self) -> usize {
        match self.inner.handle.try_lock() {
            Some(guard) => match guard.conn.try_borrow() {
                Ok(conn) => usize::from(conn.is_some()),
                Err(_) => 1,
            },
            // Someone is using the connection right now
            None => 1,
        }
    }

    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Relaxed)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.inner.location)
            .finish()
    }
}

fn location_path(location: &Location) -> Option<&Path> {
    match location {
        Location::File(path) => Some(path.as_path()),
        Location::Memory => None,
    }
}

fn connect(location: &Location, busy_timeout: Duration) -> Result<Connection> {
    let conn = match location {
        Location::File(path) => Connection::open(path).map_err(|source| StorageError::Open {
            path: path.clone(),
            source,
        })?,
        Location::Memory => Connection::open_in_memory()?,
    };

    // Enable foreign keys
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(busy_timeout)?;

    if matches!(location, Location::File(_)) {
        // WAL mode for better concurrent performance
        let _: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    }

    Ok(conn)
}
