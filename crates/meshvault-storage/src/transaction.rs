//! Scoped transactions with nesting and retry-on-lock
//!
//! [`TransactionManager::begin`] opens a scope on the shared handle. A nested
//! `begin` on the same thread joins the outer transaction through a SQLite
//! savepoint: its rollback discards only its own work and its commit merely
//! releases the savepoint. Only the outermost commit or rollback reaches the
//! store.
//!
//! [`TransactionManager::transaction`] runs a closure in a scope and, for the
//! outermost scope, retries the whole closure when the error handler reports
//! a recoverable failure.

use parking_lot::{ReentrantMutexGuard, RwLock};
use rusqlite::Connection;
use std::cell::Ref;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::database::{Database, Handle};
use crate::error::{AsStorageError, ErrorKind, StorageError};
use crate::recovery::ErrorHandler;
use crate::Result;

/// Hook run against the connection right before every outermost `COMMIT`
pub type PreCommitHook = Arc<dyn Fn(&Connection) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Take the write lock up front
    Immediate,
    /// Take locks lazily on first read/write
    Deferred,
}

impl Behavior {
    fn begin_sql(&self) -> &'static str {
        match self {
            Behavior::Immediate => "BEGIN IMMEDIATE",
            Behavior::Deferred => "BEGIN DEFERRED",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionStats {
    pub open: usize,
    pub commits: u64,
    pub rollbacks: u64,
    pub retries: u64,
    /// Scopes dropped without an explicit commit or rollback
    pub leaked: u64,
}

#[derive(Default)]
struct ManagerState {
    open: AtomicUsize,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    retries: AtomicU64,
    leaked: AtomicU64,
    pre_commit: RwLock<Option<PreCommitHook>>,
}

pub struct TransactionManager {
    db: Database,
    handler: ErrorHandler,
    state: Arc<ManagerState>,
}

impl TransactionManager {
    pub fn new(db: Database, handler: ErrorHandler) -> Self {
        Self {
            db,
            handler,
            state: Arc::new(ManagerState::default()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.handler
    }

    /// Open a write scope, or join the one already open on this thread
    pub fn begin(&self) -> Result<Transaction<'_>> {
        self.begin_with(Behavior::Immediate)
    }

    pub fn begin_with(&self, behavior: Behavior) -> Result<Transaction<'_>> {
        let guard = self.db.acquire(self.handler.policy().lock_wait())?;
        let depth = guard.depth.get();

        {
            let conn = guard.conn.borrow();
            let conn = conn.as_ref().ok_or(StorageError::Closed)?;
            if depth == 0 {
                conn.execute_batch(behavior.begin_sql())?;
            } else {
                conn.execute_batch(&format!("SAVEPOINT {}", savepoint_name(depth)))?;
            }
        }

        guard.depth.set(depth + 1);
        if depth == 0 {
            self.state.open.fetch_add(1, Ordering::SeqCst);
        }

        Ok(Transaction {
            guard,
            state: &self.state,
            level: depth,
            finished: false,
            _not_send: PhantomData,
        })
    }

    /// Run `body` in a write transaction, joining the current one if any.
    ///
    /// Outermost bodies are retried as a whole on recoverable failures. Lock
    /// contention that outlasts the retry policy surfaces as
    /// [`StorageError::LockTimeout`].
    pub fn transaction<T, E, F>(&self, body: F) -> std::result::Result<T, E>
    where
        F: FnMut(&Transaction<'_>) -> std::result::Result<T, E>,
        E: From<StorageError> + AsStorageError,
    {
        self.run(Behavior::Immediate, body)
    }

    /// Run `body` in a deferred (read) transaction
    pub fn read<T, E, F>(&self, body: F) -> std::result::Result<T, E>
    where
        F: FnMut(&Transaction<'_>) -> std::result::Result<T, E>,
        E: From<StorageError> + AsStorageError,
    {
        self.run(Behavior::Deferred, body)
    }

    fn run<T, E, F>(&self, behavior: Behavior, mut body: F) -> std::result::Result<T, E>
    where
        F: FnMut(&Transaction<'_>) -> std::result::Result<T, E>,
        E: From<StorageError> + AsStorageError,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let (outermost, outcome) = match self.begin_with(behavior) {
                Ok(tx) => {
                    let outermost = tx.is_outermost();
                    let outcome = match body(&tx) {
                        Ok(value) => tx.commit().map(|_| value).map_err(E::from),
                        Err(e) => {
                            if let Err(rollback_err) = tx.rollback() {
                                tracing::error!(error = %rollback_err, "Rollback failed");
                            }
                            Err(e)
                        }
                    };
                    (outermost, outcome)
                }
                // Failing to begin means nothing is held yet, so retrying is safe
                Err(e) => (true, Err(E::from(e))),
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        self.handler.record_recovered();
                    }
                    return Ok(value);
                }
                Err(error) if !outermost => return Err(error),
                Err(error) => error,
            };

            let storage_error = match error.as_storage_error() {
                Some(storage_error) => storage_error,
                None => return Err(error),
            };

            if self.handler.attempt_recovery(storage_error, attempt) {
                self.state.retries.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if storage_error.kind() == ErrorKind::Lock && storage_error.is_recoverable() {
                tracing::error!(attempts = attempt, "Giving up on locked database");
                return Err(E::from(StorageError::LockTimeout { attempts: attempt }));
            }

            return Err(error);
        }
    }

    /// Install (or clear) the hook run before every outermost commit
    pub fn set_pre_commit_hook(&self, hook: Option<PreCommitHook>) {
        *self.state.pre_commit.write() = hook;
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            open: self.state.open.load(Ordering::SeqCst),
            commits: self.state.commits.load(Ordering::Relaxed),
            rollbacks: self.state.rollbacks.load(Ordering::Relaxed),
            retries: self.state.retries.load(Ordering::Relaxed),
            leaked: self.state.leaked.load(Ordering::Relaxed),
        }
    }

    /// Wait for open transactions to resolve, then close the handle.
    ///
    /// Fails with [`StorageError::OpenTransactions`] if a transaction is still
    /// open after `timeout`; the handle stays open in that case.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let open = self.state.open.load(Ordering::SeqCst);
            if open == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::error!(open, "Shutdown with unresolved transactions");
                return Err(StorageError::OpenTransactions { count: open });
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.db.close(remaining.max(Duration::from_millis(1)))?;

        let stats = self.stats();
        tracing::info!(
            commits = stats.commits,
            rollbacks = stats.rollbacks,
            leaked = stats.leaked,
            "Transaction manager shut down"
        );
        Ok(())
    }
}

impl Clone for TransactionManager {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            handler: self.handler.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

/// An open transaction scope.
///
/// Holding a `Transaction` keeps the handle locked for the current thread.
/// The type is deliberately `!Send`. Dropping it without `commit` or
/// `rollback` rolls back and counts as a leaked scope.
pub struct Transaction<'a> {
    guard: ReentrantMutexGuard<'a, Handle>,
    state: &'a ManagerState,
    /// 0 for the outermost scope, savepoint depth otherwise
    level: usize,
    finished: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Transaction<'a> {
    /// Connection for statements inside this scope
    pub fn conn(&self) -> Result<Ref<'_, Connection>> {
        Ref::filter_map(self.guard.conn.borrow(), Option::as_ref).map_err(|_| StorageError::Closed)
    }

    pub fn is_outermost(&self) -> bool {
        self.level == 0
    }

    /// Nesting depth, 1 for the outermost scope
    pub fn depth(&self) -> usize {
        self.level + 1
    }

    /// Run `f` after the outermost transaction commits or rolls back
    pub fn on_finish<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.guard.finish_hooks.borrow_mut().push(Box::new(f));
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.finish(true)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.finish(false)
    }

    fn finish(&mut self, commit: bool) -> Result<()> {
        self.guard.depth.set(self.level);

        if self.level > 0 {
            let name = savepoint_name(self.level);
            let sql = if commit {
                format!("RELEASE {name}")
            } else {
                format!("ROLLBACK TO {name}; RELEASE {name}")
            };
            return self.exec(&sql);
        }

        let result = if commit {
            let hook = self.state.pre_commit.read().clone();
            let committed = match hook {
                Some(hook) => self.with_conn(|conn| hook(conn)),
                None => Ok(()),
            }
            .and_then(|_| self.exec("COMMIT"));

            match committed {
                Ok(()) => {
                    self.state.commits.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(e) => {
                    // A failed COMMIT may leave the transaction open
                    if let Err(rollback_err) = self.exec("ROLLBACK") {
                        tracing::warn!(
                            error = %rollback_err,
                            "Rollback after failed commit failed"
                        );
                    }
                    self.state.rollbacks.fetch_add(1, Ordering::Relaxed);
                    Err(e)
                }
            }
        } else {
            self.state.rollbacks.fetch_add(1, Ordering::Relaxed);
            self.exec("ROLLBACK")
        };

        self.state.open.fetch_sub(1, Ordering::SeqCst);

        let hooks = std::mem::take(&mut *self.guard.finish_hooks.borrow_mut());
        for hook in hooks {
            hook();
        }

        result
    }

    fn exec(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn()?;
        f(&conn)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.state.leaked.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(depth = self.depth(), "Transaction dropped without commit; rolling back");
        if let Err(e) = self.finish(false) {
            tracing::error!(error = %e, "Rollback of dropped transaction failed");
        }
    }
}

fn savepoint_name(level: usize) -> String {
    format!("sp_{level}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::sqlite_failure;
    use crate::recovery::RetryPolicy;
    use rusqlite::ffi;
    use std::sync::atomic::AtomicU32;

    fn manager() -> TransactionManager {
        let db = Database::open_in_memory().unwrap();
        let handler = ErrorHandler::new(
            db.clone(),
            RetryPolicy {
                max_attempts: 5,
                base_delay_ms: 1,
                max_delay_ms: 2,
                lock_wait_ms: 100,
            },
        );
        let tm = TransactionManager::new(db, handler);
        tm.transaction(|tx| -> Result<()> {
            tx.conn()?
                .execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)")?;
            Ok(())
        })
        .unwrap();
        tm
    }

    fn count(tm: &TransactionManager) -> i64 {
        tm.read(|tx| -> Result<i64> {
            Ok(tx
                .conn()?
                .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?)
        })
        .unwrap()
    }

    fn insert(tx: &Transaction<'_>, name: &str) -> Result<()> {
        tx.conn()?
            .execute("INSERT INTO items (name) VALUES (?1)", [name])?;
        Ok(())
    }

    #[test]
    fn test_commit_persists() {
        let tm = manager();
        let tx = tm.begin().unwrap();
        insert(&tx, "a").unwrap();
        insert(&tx, "b").unwrap();
        tx.commit().unwrap();

        assert_eq!(count(&tm), 2);
        assert_eq!(tm.stats().open, 0);
    }

    #[test]
    fn test_rollback_discards_everything() {
        let tm = manager();
        let tx = tm.begin().unwrap();
        insert(&tx, "a").unwrap();
        tx.rollback().unwrap();

        assert_eq!(count(&tm), 0);
    }

    #[test]
    fn test_failure_midway_leaves_no_partial_writes() {
        let tm = manager();
        let names = ["a", "b", "c", "d", "e"];

        let result = tm.transaction(|tx| -> Result<()> {
            for (i, name) in names.iter().enumerate() {
                if i == 3 {
                    // duplicate name violates the unique constraint
                    insert(tx, "a")?;
                }
                insert(tx, name)?;
            }
            Ok(())
        });

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
        assert_eq!(count(&tm), 0);
    }

    #[test]
    fn test_nested_scope_joins_outer() {
        let tm = manager();
        let outer = tm.begin().unwrap();
        insert(&outer, "outer").unwrap();

        tm.transaction(|inner| -> Result<()> {
            assert!(!inner.is_outermost());
            assert_eq!(inner.depth(), 2);
            insert(inner, "inner")
        })
        .unwrap();

        // Only one store-level transaction is open
        assert_eq!(tm.stats().open, 1);
        outer.rollback().unwrap();

        assert_eq!(count(&tm), 0);
    }

    #[test]
    fn test_nested_rollback_discards_only_inner_work() {
        let tm = manager();
        let outer = tm.begin().unwrap();
        insert(&outer, "kept").unwrap();

        let inner = tm.begin().unwrap();
        insert(&inner, "discarded").unwrap();
        inner.rollback().unwrap();

        outer.commit().unwrap();
        assert_eq!(count(&tm), 1);
    }

    #[test]
    fn test_dropped_scope_rolls_back_and_counts_leak() {
        let tm = manager();
        {
            let tx = tm.begin().unwrap();
            insert(&tx, "lost").unwrap();
        }

        assert_eq!(count(&tm), 0);
        let stats = tm.stats();
        assert_eq!(stats.leaked, 1);
        assert_eq!(stats.open, 0);
    }

    #[test]
    fn test_panicking_body_releases_the_handle() {
        let tm = manager();
        let cloned = tm.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = cloned.transaction(|tx| -> Result<()> {
                insert(tx, "boom")?;
                panic!("body panicked");
            });
        }));
        assert!(result.is_err());

        assert_eq!(count(&tm), 0);
        assert_eq!(tm.stats().open, 0);
    }

    #[test]
    fn test_lock_error_on_commit_is_retried() {
        let tm = manager();
        let failures = Arc::new(AtomicU32::new(0));
        let hook_failures = Arc::clone(&failures);
        tm.set_pre_commit_hook(Some(Arc::new(move |_conn: &Connection| {
            if hook_failures.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(sqlite_failure(ffi::SQLITE_BUSY, "database is locked"))
            } else {
                Ok(())
            }
        })));

        tm.transaction(|tx| insert(tx, "eventually")).unwrap();

        assert_eq!(count(&tm), 1);
        assert_eq!(tm.stats().retries, 3);
        let recovery = tm.error_handler().stats();
        assert_eq!(recovery.attempts, 3);
        assert_eq!(recovery.recovered, 1);
    }

    #[test]
    fn test_persistent_lock_surfaces_lock_timeout() {
        let tm = manager();
        tm.set_pre_commit_hook(Some(Arc::new(|_conn: &Connection| {
            Err(sqlite_failure(ffi::SQLITE_BUSY, "database is locked"))
        })));

        let err = tm.transaction(|tx| insert(tx, "never")).unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { attempts: 5 }));
        tm.set_pre_commit_hook(None);
        assert_eq!(count(&tm), 0);
    }

    #[test]
    fn test_failed_commit_rolls_back_and_frees_handle() {
        let tm = manager();
        tm.set_pre_commit_hook(Some(Arc::new(|_conn: &Connection| {
            Err(sqlite_failure(ffi::SQLITE_CONSTRAINT, "constraint failed"))
        })));

        let err = tm.transaction(|tx| insert(tx, "rejected")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
        tm.set_pre_commit_hook(None);

        let stats = tm.stats();
        assert_eq!(stats.open, 0);
        assert_eq!(stats.retries, 0);

        tm.transaction(|tx| insert(tx, "accepted")).unwrap();
        assert_eq!(count(&tm), 1);
    }

    #[test]
    fn test_other_thread_waits_for_outermost_scope() {
        let tm = manager();
        let tx = tm.begin().unwrap();
        insert(&tx, "held").unwrap();

        let other = tm.clone();
        let waiter = std::thread::spawn(move || {
            other.transaction(|tx| -> Result<()> { insert(tx, "after") })
        });

        std::thread::sleep(Duration::from_millis(20));
        tx.commit().unwrap();

        waiter.join().unwrap().unwrap();
        assert_eq!(count(&tm), 2);
    }

    #[test]
    fn test_finish_hooks_run_once_after_outermost() {
        let tm = manager();
        let calls = Arc::new(AtomicU32::new(0));

        let outer = tm.begin().unwrap();
        let inner = tm.begin().unwrap();
        let hook_calls = Arc::clone(&calls);
        inner.on_finish(move || {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        });
        inner.commit().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        outer.commit().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_refuses_with_open_transaction() {
        let tm = manager();
        let other = tm.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let holder = std::thread::spawn(move || {
            let tx = other.begin().unwrap();
            ready_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            tx.commit().unwrap();
        });

        ready_rx.recv().unwrap();
        let err = tm.shutdown(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, StorageError::OpenTransactions { count: 1 }));

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        tm.shutdown(Duration::from_millis(500)).unwrap();

        assert!(matches!(tm.begin().err(), Some(StorageError::Closed)));
    }
}
