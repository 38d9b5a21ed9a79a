//! Database migrations
//!
//! Schema: models, metadata, search index, projects.
//!
//! Every applied step appends a row to `schema_migrations` and moves the
//! single-row `schema_version` marker, both in the same transaction as the
//! schema change itself. History rows are never updated or deleted; rolling a
//! version back appends a `down` row.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::error::{AsStorageError, StorageError};
use crate::transaction::TransactionManager;

/// One versioned schema step
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

impl Migration {
    /// SHA-256 of the up script, recorded when the step is applied
    pub fn checksum(&self) -> String {
        format!("{:x}", Sha256::digest(self.up.as_bytes()))
    }

    pub fn up_script_id(&self) -> String {
        format!("{:04}_{}.up", self.version, self.name)
    }

    pub fn down_script_id(&self) -> String {
        format!("{:04}_{}.down", self.version, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// A row of the migration history
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    pub version: u32,
    pub name: String,
    pub direction: Direction,
    pub script: String,
    pub checksum: String,
    pub applied_at: String,
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Migration versions must be contiguous from 1: expected {expected}, found {found}")]
    NonContiguous { expected: u32, found: u32 },

    #[error("Migration {version} has diverged: recorded checksum {recorded}, expected {expected}")]
    ChecksumMismatch {
        version: u32,
        recorded: String,
        expected: String,
    },

    #[error("Store is at version {found}, newer than the latest known migration {latest}")]
    UnknownVersion { found: u32, latest: u32 },

    #[error("Store is at version {version} but has no record of applying it")]
    MissingRecord { version: u32 },

    #[error("Target version {target} is beyond the latest migration {latest}")]
    InvalidTarget { target: u32, latest: u32 },

    #[error("Migration {version} ({name}) failed: {source}")]
    StepFailed {
        version: u32,
        name: &'static str,
        #[source]
        source: StorageError,
    },

    #[error("Migration cancelled at version {reached}")]
    Cancelled { reached: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<rusqlite::Error> for MigrationError {
    fn from(error: rusqlite::Error) -> Self {
        MigrationError::Storage(error.into())
    }
}

impl AsStorageError for MigrationError {
    fn as_storage_error(&self) -> Option<&StorageError> {
        match self {
            MigrationError::Storage(e) | MigrationError::StepFailed { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

pub type MigrationResult<T> = std::result::Result<T, MigrationError>;

pub struct MigrationManager {
    tm: TransactionManager,
    migrations: Vec<Migration>,
}

impl MigrationManager {
    /// Create a manager for the given migration set.
    ///
    /// The set is sorted by version and must cover `1..=n` without gaps.
    pub fn new(tm: TransactionManager, mut migrations: Vec<Migration>) -> MigrationResult<Self> {
        migrations.sort_by_key(|m| m.version);
        for (index, migration) in migrations.iter().enumerate() {
            let expected = index as u32 + 1;
            if migration.version != expected {
                return Err(MigrationError::NonContiguous {
                    expected,
                    found: migration.version,
                });
            }
        }

        Ok(Self { tm, migrations })
    }

    /// Manager for the built-in meshvault schema
    pub fn builtin(tm: TransactionManager) -> MigrationResult<Self> {
        Self::new(tm, builtin_migrations())
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }

    pub fn current_version(&self) -> MigrationResult<u32> {
        self.tm.read(|tx| {
            let conn = tx.conn()?;
            Ok(read_version(&conn)?)
        })
    }

    /// Migrations that `apply_migrations(target)` would run
    pub fn pending(&self, target: Option<u32>) -> MigrationResult<Vec<&Migration>> {
        let target = self.resolve_target(target)?;
        let current = self.current_version()?;
        Ok(self
            .migrations
            .iter()
            .filter(|m| m.version > current && m.version <= target)
            .collect())
    }

    pub fn apply_migrations(&self, target: Option<u32>) -> MigrationResult<u32> {
        self.apply_migrations_with_cancel(target, &CancelToken::new())
    }

    /// Apply pending up-migrations in ascending order up to `target`.
    ///
    /// Each step runs in its own transaction. A failing step is rolled back
    /// and stops the sequence; the store stays at the last applied version.
    pub fn apply_migrations_with_cancel(
        &self,
        target: Option<u32>,
        cancel: &CancelToken,
    ) -> MigrationResult<u32> {
        let target = self.resolve_target(target)?;
        self.ensure_bookkeeping()?;
        let start = self.verify_history()?;
        let mut current = start;

        if current >= target {
            tracing::debug!(current, target, "No pending migrations");
            return Ok(current);
        }

        for migration in self
            .migrations
            .iter()
            .filter(|m| m.version > start && m.version <= target)
        {
            if cancel.is_cancelled() {
                tracing::warn!(reached = current, "Migration cancelled");
                return Err(MigrationError::Cancelled { reached: current });
            }

            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Running migration"
            );
            self.step(migration, Direction::Up)?;
            current = migration.version;
        }

        tracing::info!(version = current, "Schema is up to date");
        Ok(current)
    }

    pub fn rollback(&self, steps: u32) -> MigrationResult<u32> {
        self.rollback_with_cancel(steps, &CancelToken::new())
    }

    /// Apply down-migrations in descending order, one transaction per step
    pub fn rollback_with_cancel(&self, steps: u32, cancel: &CancelToken) -> MigrationResult<u32> {
        self.ensure_bookkeeping()?;
        let start = self.verify_history()?;
        let mut current = start;
        let floor = start.saturating_sub(steps);

        for migration in self
            .migrations
            .iter()
            .rev()
            .filter(|m| m.version <= start && m.version > floor)
        {
            if cancel.is_cancelled() {
                tracing::warn!(reached = current, "Rollback cancelled");
                return Err(MigrationError::Cancelled { reached: current });
            }

            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Reverting migration"
            );
            self.step(migration, Direction::Down)?;
            current = migration.version - 1;
        }

        Ok(current)
    }

    /// Full migration history, oldest first
    pub fn history(&self) -> MigrationResult<Vec<MigrationRecord>> {
        self.tm.read(|tx| {
            let conn = tx.conn()?;
            if !table_exists(&conn, "schema_migrations")? {
                return Ok(Vec::new());
            }

            let mut stmt = conn.prepare(
                "SELECT version, name, direction, script, checksum, applied_at
                 FROM schema_migrations ORDER BY id",
            )?;
            let records = stmt
                .query_map([], |row| {
                    let direction: String = row.get(2)?;
                    Ok(MigrationRecord {
                        version: row.get(0)?,
                        name: row.get(1)?,
                        direction: if direction == "down" {
                            Direction::Down
                        } else {
                            Direction::Up
                        },
                        script: row.get(3)?,
                        checksum: row.get(4)?,
                        applied_at: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StorageError::from)?;
            Ok(records)
        })
    }

    fn resolve_target(&self, target: Option<u32>) -> MigrationResult<u32> {
        let latest = self.latest_version();
        match target {
            Some(target) if target > latest => Err(MigrationError::InvalidTarget { target, latest }),
            Some(target) => Ok(target),
            None => Ok(latest),
        }
    }

    fn ensure_bookkeeping(&self) -> MigrationResult<()> {
        self.tm.transaction(|tx| {
            tx.conn()?.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS schema_version (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    version INTEGER NOT NULL
                );
                INSERT OR IGNORE INTO schema_version (id, version) VALUES (1, 0);

                CREATE TABLE IF NOT EXISTS schema_migrations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    version INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    direction TEXT NOT NULL CHECK (direction IN ('up', 'down')),
                    script TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    applied_at TEXT NOT NULL
                );
                "#,
            )?;
            Ok(())
        })
    }

    /// Check that the recorded history matches the known migrations.
    ///
    /// Returns the current version.
    fn verify_history(&self) -> MigrationResult<u32> {
        self.tm.read(|tx| {
            let conn = tx.conn()?;
            let current = read_version(&conn)?;
            let latest = self.latest_version();
            if current > latest {
                return Err(MigrationError::UnknownVersion {
                    found: current,
                    latest,
                });
            }

            for migration in self.migrations.iter().filter(|m| m.version <= current) {
                let recorded: Option<String> = conn
                    .query_row(
                        "SELECT checksum FROM schema_migrations
                         WHERE version = ?1 AND direction = 'up'
                         ORDER BY id DESC LIMIT 1",
                        [migration.version],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(StorageError::from)?;

                let expected = migration.checksum();
                match recorded {
                    None => {
                        return Err(MigrationError::MissingRecord {
                            version: migration.version,
                        })
                    }
                    Some(recorded) if recorded != expected => {
                        tracing::error!(
                            version = migration.version,
                            "Migration checksum mismatch"
                        );
                        return Err(MigrationError::ChecksumMismatch {
                            version: migration.version,
                            recorded,
                            expected,
                        });
                    }
                    Some(_) => {}
                }
            }

            Ok(current)
        })
    }

    fn step(&self, migration: &Migration, direction: Direction) -> MigrationResult<()> {
        let (script, script_id, new_version) = match direction {
            Direction::Up => (migration.up, migration.up_script_id(), migration.version),
            Direction::Down => (
                migration.down,
                migration.down_script_id(),
                migration.version - 1,
            ),
        };
        let checksum = migration.checksum();

        self.tm
            .transaction(|tx| -> crate::Result<()> {
                let conn = tx.conn()?;
                conn.execute_batch(script)?;
                conn.execute(
                    "INSERT INTO schema_migrations
                     (version, name, direction, script, checksum, applied_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        migration.version,
                        migration.name,
                        direction.as_str(),
                        script_id,
                        checksum,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                conn.execute(
                    "UPDATE schema_version SET version = ?1 WHERE id = 1",
                    [new_version],
                )?;
                Ok(())
            })
            .map_err(|source| {
                tracing::error!(
                    version = migration.version,
                    name = migration.name,
                    error = %source,
                    "Migration failed"
                );
                MigrationError::StepFailed {
                    version: migration.version,
                    name: migration.name,
                    source,
                }
            })
    }
}

impl Clone for MigrationManager {
    fn clone(&self) -> Self {
        Self {
            tm: self.tm.clone(),
            migrations: self.migrations.clone(),
        }
    }
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
        .exists([name])
}

fn read_version(conn: &Connection) -> crate::Result<u32> {
    if !table_exists(conn, "schema_version")? {
        return Ok(0);
    }

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(version.unwrap_or(0))
}

/// The meshvault schema, oldest first
pub fn builtin_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "models_and_metadata",
            up: r#"
                CREATE TABLE models (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    file_path TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
                    format TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    modified_at INTEGER NOT NULL
                );

                CREATE INDEX idx_models_hash ON models(content_hash);
                CREATE INDEX idx_models_format ON models(format);
                CREATE INDEX idx_models_modified ON models(modified_at);

                CREATE TABLE metadata (
                    model_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value_type TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (model_id, key),
                    FOREIGN KEY (model_id) REFERENCES models(id) ON DELETE CASCADE
                );

                CREATE INDEX idx_metadata_key ON metadata(key);
            "#,
            down: r#"
                DROP TABLE metadata;
                DROP TABLE models;
            "#,
        },
        Migration {
            version: 2,
            name: "search_index",
            up: r#"
                CREATE TABLE search_index (
                    model_id TEXT NOT NULL,
                    field TEXT NOT NULL,
                    value TEXT NOT NULL,
                    FOREIGN KEY (model_id) REFERENCES models(id) ON DELETE CASCADE
                );

                CREATE INDEX idx_search_value ON search_index(value);
                CREATE INDEX idx_search_model ON search_index(model_id);

                INSERT INTO search_index (model_id, field, value)
                    SELECT id, 'name', lower(name) FROM models
                    UNION ALL SELECT id, 'path', lower(file_path) FROM models
                    UNION ALL SELECT id, 'format', lower(format) FROM models
                    UNION ALL SELECT id, 'hash', lower(content_hash) FROM models
                    UNION ALL SELECT model_id, 'meta:' || key, lower(value) FROM metadata;
            "#,
            down: r#"
                DROP TABLE search_index;
            "#,
        },
        Migration {
            version: 3,
            name: "projects",
            up: r#"
                CREATE TABLE projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    created_at INTEGER NOT NULL,
                    modified_at INTEGER NOT NULL
                );

                CREATE UNIQUE INDEX idx_projects_name ON projects(name COLLATE NOCASE);

                CREATE TABLE project_models (
                    project_id TEXT NOT NULL,
                    model_id TEXT NOT NULL,
                    added_at INTEGER NOT NULL,
                    PRIMARY KEY (project_id, model_id),
                    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
                    FOREIGN KEY (model_id) REFERENCES models(id) ON DELETE CASCADE
                );

                CREATE INDEX idx_project_models_model ON project_models(model_id);
            "#,
            down: r#"
                DROP TABLE project_models;
                DROP TABLE projects;
            "#,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::recovery::{ErrorHandler, RetryPolicy};

    fn manager() -> MigrationManager {
        let db = Database::open_in_memory().unwrap();
        let handler = ErrorHandler::new(db.clone(), RetryPolicy::default());
        MigrationManager::builtin(TransactionManager::new(db, handler)).unwrap()
    }

    fn schema(manager: &MigrationManager) -> Vec<String> {
        manager
            .tm
            .read(|tx| -> crate::Result<Vec<String>> {
                let conn = tx.conn()?;
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY name",
                )?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(names)
            })
            .unwrap()
    }

    #[test]
    fn test_empty_store_is_version_zero() {
        let manager = manager();
        assert_eq!(manager.current_version().unwrap(), 0);
        assert_eq!(manager.pending(None).unwrap().len(), 3);
    }

    #[test]
    fn test_apply_all_then_noop() {
        let manager = manager();
        assert_eq!(manager.apply_migrations(None).unwrap(), 3);
        assert_eq!(manager.current_version().unwrap(), 3);

        let schema_once = schema(&manager);
        let history_once = manager.history().unwrap().len();
        assert!(schema_once.contains(&"models".to_string()));
        assert!(schema_once.contains(&"search_index".to_string()));
        assert!(schema_once.contains(&"project_models".to_string()));

        assert_eq!(manager.apply_migrations(None).unwrap(), 3);
        assert_eq!(schema(&manager), schema_once);
        assert_eq!(manager.history().unwrap().len(), history_once);
    }

    #[test]
    fn test_apply_to_target_then_rest() {
        let manager = manager();
        assert_eq!(manager.apply_migrations(Some(1)).unwrap(), 1);
        assert!(!schema(&manager).contains(&"search_index".to_string()));

        assert_eq!(manager.apply_migrations(None).unwrap(), 3);
        let versions: Vec<u32> = manager.history().unwrap().iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_target_beyond_latest_is_rejected() {
        let manager = manager();
        assert!(matches!(
            manager.apply_migrations(Some(9)),
            Err(MigrationError::InvalidTarget { target: 9, latest: 3 })
        ));
    }

    #[test]
    fn test_rollback_in_descending_order() {
        let manager = manager();
        manager.apply_migrations(None).unwrap();

        assert_eq!(manager.rollback(2).unwrap(), 1);
        assert_eq!(manager.current_version().unwrap(), 1);
        let names = schema(&manager);
        assert!(names.contains(&"models".to_string()));
        assert!(!names.contains(&"projects".to_string()));
        assert!(!names.contains(&"search_index".to_string()));

        let history = manager.history().unwrap();
        let tail: Vec<(u32, Direction)> = history
            .iter()
            .skip(3)
            .map(|r| (r.version, r.direction))
            .collect();
        assert_eq!(tail, vec![(3, Direction::Down), (2, Direction::Down)]);

        // Re-applying after a rollback works and keeps the history append-only
        assert_eq!(manager.apply_migrations(None).unwrap(), 3);
        assert_eq!(manager.history().unwrap().len(), 7);
    }

    #[test]
    fn test_failing_step_halts_at_last_good_version() {
        let db = Database::open_in_memory().unwrap();
        let handler = ErrorHandler::new(db.clone(), RetryPolicy::default());
        let tm = TransactionManager::new(db, handler);
        let mut migrations = builtin_migrations();
        migrations[1].up = "CREATE TABLE search_index (model_id TEXT); THIS IS NOT SQL;";
        let manager = MigrationManager::new(tm, migrations).unwrap();

        let err = manager.apply_migrations(None).unwrap_err();
        assert!(matches!(err, MigrationError::StepFailed { version: 2, .. }));
        assert_eq!(manager.current_version().unwrap(), 1);
        // The failed step's partial DDL was rolled back
        assert!(!schema(&manager).contains(&"search_index".to_string()));
    }

    #[test]
    fn test_checksum_divergence_fails_loudly() {
        let manager = manager();
        manager.apply_migrations(Some(2)).unwrap();

        let mut changed = builtin_migrations();
        changed[0].up = "CREATE TABLE models (id TEXT PRIMARY KEY);";
        let diverged = MigrationManager::new(manager.tm.clone(), changed).unwrap();

        let err = diverged.apply_migrations(None).unwrap_err();
        assert!(matches!(err, MigrationError::ChecksumMismatch { version: 1, .. }));
        assert_eq!(manager.current_version().unwrap(), 2);
    }

    #[test]
    fn test_newer_store_is_rejected() {
        let manager = manager();
        manager.apply_migrations(None).unwrap();

        let older = MigrationManager::new(
            manager.tm.clone(),
            builtin_migrations().into_iter().take(2).collect(),
        )
        .unwrap();
        assert!(matches!(
            older.apply_migrations(None),
            Err(MigrationError::UnknownVersion { found: 3, latest: 2 })
        ));
    }

    #[test]
    fn test_gaps_are_rejected() {
        let db = Database::open_in_memory().unwrap();
        let handler = ErrorHandler::new(db.clone(), RetryPolicy::default());
        let tm = TransactionManager::new(db, handler);
        let mut migrations = builtin_migrations();
        migrations.remove(1);

        assert!(matches!(
            MigrationManager::new(tm, migrations),
            Err(MigrationError::NonContiguous { expected: 2, found: 3 })
        ));
    }

    #[test]
    fn test_cancel_between_steps() {
        let manager = manager();
        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            manager.apply_migrations_with_cancel(None, &cancel),
            Err(MigrationError::Cancelled { reached: 0 })
        ));
        assert_eq!(manager.current_version().unwrap(), 0);
    }
}
