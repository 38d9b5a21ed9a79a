//! Metadata repository
//!
//! Key/value metadata attached to models. All entries of one model are cached
//! together under `metadata:<model_id>:entries`.

use rusqlite::{params, Connection, OptionalExtension};

use meshvault_cache::{cache_key, key_prefix};

use crate::context::RepositoryContext;
use crate::error::RepositoryError;
use crate::model::model_exists;
use crate::models::{normalize_key, now, to_micros, MetadataEntry, MetadataValue, TAGS_KEY};
use crate::search;
use crate::Result;

pub(crate) const METADATA_FAMILY: &str = "metadata";

const ENTRY_COLUMNS: &str = "model_id, key, value_type, value, updated_at";

pub struct MetadataRepository {
    ctx: RepositoryContext,
}

impl MetadataRepository {
    pub fn new(ctx: RepositoryContext) -> Self {
        Self { ctx }
    }

    /// Add a new entry. Fails with `Duplicate` if the key already exists.
    pub fn add(&self, model_id: &str, key: &str, value: MetadataValue) -> Result<MetadataEntry> {
        self.write_entry("metadata.add", model_id, key, value, WriteMode::Insert)
    }

    /// Insert or replace an entry
    pub fn set(&self, model_id: &str, key: &str, value: MetadataValue) -> Result<MetadataEntry> {
        self.write_entry("metadata.set", model_id, key, value, WriteMode::Upsert)
    }

    /// Replace an existing entry. Fails with `NotFound` if the key is absent.
    pub fn update(&self, model_id: &str, key: &str, value: MetadataValue) -> Result<MetadataEntry> {
        self.write_entry("metadata.update", model_id, key, value, WriteMode::Replace)
    }

    pub fn get(&self, model_id: &str, key: &str) -> Result<Option<MetadataEntry>> {
        let key = key.trim();
        Ok(self.read(model_id)?.into_iter().find(|e| e.key == key))
    }

    /// Every entry of a model ordered by key; empty for unknown models
    pub fn read(&self, model_id: &str) -> Result<Vec<MetadataEntry>> {
        let key = cache_key(METADATA_FAMILY, model_id, "entries");
        let entries = self
            .ctx
            .cached("metadata.read", &key, |tx| {
                let conn = tx.conn()?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM metadata WHERE model_id = ?1 ORDER BY key"
                ))?;
                let entries = stmt
                    .query_map([model_id], MetadataEntry::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(Some(entries))
            })
            .map_err(|e| e.context("metadata.read", model_id))?;
        Ok(entries.unwrap_or_default())
    }

    /// Keys of a model's entries, sorted
    pub fn list(&self, model_id: &str) -> Result<Vec<String>> {
        Ok(self.read(model_id)?.into_iter().map(|e| e.key).collect())
    }

    /// Normalised tags of a model
    pub fn tags(&self, model_id: &str) -> Result<Vec<String>> {
        Ok(self
            .get(model_id, TAGS_KEY)?
            .map(|e| e.value.as_tags())
            .unwrap_or_default())
    }

    pub fn exists(&self, model_id: &str, key: &str) -> Result<bool> {
        Ok(self.get(model_id, key)?.is_some())
    }

    pub fn count(&self, model_id: &str) -> Result<usize> {
        Ok(self.read(model_id)?.len())
    }

    /// Remove one entry. Returns false if it did not exist.
    pub fn delete(&self, model_id: &str, key: &str) -> Result<bool> {
        let key = normalize_key(key)?;
        let removed = self
            .ctx
            .write("metadata.delete", |tx| {
                let conn = tx.conn()?;
                let removed = conn.execute(
                    "DELETE FROM metadata WHERE model_id = ?1 AND key = ?2",
                    params![model_id, key],
                )?;
                if removed > 0 {
                    search::write_index(&conn, model_id)?;
                    self.invalidate(tx, model_id);
                }
                Ok(removed > 0)
            })
            .map_err(|e| e.context("metadata.delete", model_id))?;

        if removed {
            tracing::debug!(model_id = %model_id, key = %key, "Deleted metadata");
        }
        Ok(removed)
    }

    /// Remove every entry of a model. Returns how many were removed.
    pub fn delete_all(&self, model_id: &str) -> Result<usize> {
        self.ctx
            .write("metadata.delete_all", |tx| {
                let conn = tx.conn()?;
                let removed = conn.execute("DELETE FROM metadata WHERE model_id = ?1", [model_id])?;
                if removed > 0 {
                    search::write_index(&conn, model_id)?;
                    self.invalidate(tx, model_id);
                }
                Ok(removed)
            })
            .map_err(|e| e.context("metadata.delete_all", model_id))
    }

    /// Entries across all models whose `key` holds exactly `value`
    pub fn search(&self, key: &str, value: &MetadataValue) -> Result<Vec<MetadataEntry>> {
        let key = normalize_key(key)?;
        let raw = value.encode()?;
        self.ctx.read("metadata.search", |tx| {
            let conn = tx.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM metadata
                 WHERE key = ?1 AND value_type = ?2 AND value = ?3
                 ORDER BY model_id"
            ))?;
            let entries = stmt
                .query_map(params![key, value.type_tag(), raw], MetadataEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    fn write_entry(
        &self,
        operation: &'static str,
        model_id: &str,
        key: &str,
        value: MetadataValue,
        mode: WriteMode,
    ) -> Result<MetadataEntry> {
        let key = normalize_key(key)?;
        value.validate()?;
        let raw = value.encode()?;

        let entry = MetadataEntry {
            model_id: model_id.to_string(),
            key,
            value,
            updated_at: now(),
        };

        self.ctx
            .write(operation, |tx| {
                let conn = tx.conn()?;
                if !model_exists(&conn, model_id)? {
                    return Err(RepositoryError::MissingModel(model_id.to_string()));
                }

                let present = entry_exists(&conn, model_id, &entry.key)?;
                match (mode, present) {
                    (WriteMode::Insert, true) => {
                        return Err(RepositoryError::Duplicate {
                            entity: "metadata",
                            key: format!("{model_id}/{}", entry.key),
                        })
                    }
                    (WriteMode::Replace, false) => {
                        return Err(RepositoryError::NotFound {
                            entity: "Metadata",
                            id: format!("{model_id}/{}", entry.key),
                        })
                    }
                    _ => {}
                }

                conn.execute(
                    "INSERT INTO metadata (model_id, key, value_type, value, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (model_id, key) DO UPDATE SET
                         value_type = excluded.value_type,
                         value = excluded.value,
                         updated_at = excluded.updated_at",
                    params![
                        model_id,
                        entry.key,
                        entry.value.type_tag(),
                        raw,
                        to_micros(entry.updated_at),
                    ],
                )?;
                search::write_index(&conn, model_id)?;
                self.invalidate(tx, model_id);
                Ok(())
            })
            .map_err(|e| e.context(operation, model_id))?;

        tracing::debug!(model_id = %model_id, key = %entry.key, "Wrote metadata");
        Ok(entry)
    }

    fn invalidate(&self, tx: &meshvault_storage::Transaction<'_>, model_id: &str) {
        self.ctx
            .invalidate_on_write(tx, vec![key_prefix(METADATA_FAMILY, model_id)]);
        search::invalidate_results(&self.ctx, tx);
    }
}

impl Clone for MetadataRepository {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    /// Key must be new
    Insert,
    /// Key must exist
    Replace,
    Upsert,
}

fn entry_exists(conn: &Connection, model_id: &str, key: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM metadata WHERE model_id = ?1 AND key = ?2",
            params![model_id, key],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}
