//! Model repository

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use meshvault_cache::{cache_key, family_prefix, key_prefix};
use meshvault_storage::ErrorKind;

use crate::context::RepositoryContext;
use crate::error::RepositoryError;
use crate::metadata::METADATA_FAMILY;
use crate::models::{
    now, to_micros, ListOptions, ListOrder, ModelRecord, ModelUpdate, NewModel, MODEL_COLUMNS,
};
use crate::project::PROJECT_FAMILY;
use crate::search::{self, SearchQuery, SearchRepository};
use crate::Result;

pub(crate) const MODEL_FAMILY: &str = "model";

pub struct ModelRepository {
    ctx: RepositoryContext,
    search: SearchRepository,
}

impl ModelRepository {
    pub fn new(ctx: RepositoryContext) -> Self {
        Self {
            search: SearchRepository::new(ctx.clone()),
            ctx,
        }
    }

    /// Create a model and return its new identifier
    pub fn create(&self, model: NewModel) -> Result<String> {
        self.create_with_id(&Uuid::new_v4().to_string(), model)
    }

    /// Create a model under a caller-chosen identifier (e.g. when importing a
    /// library). Fails with `Duplicate` if the identifier is taken.
    pub fn create_with_id(&self, id: &str, model: NewModel) -> Result<String> {
        let model = model.normalized()?;
        let id = id.trim();
        if id.is_empty() {
            return Err(RepositoryError::validation("id", "cannot be empty"));
        }
        let at = now();
        let record = ModelRecord {
            id: id.to_string(),
            name: model.name,
            file_path: model.file_path,
            content_hash: model.content_hash,
            size_bytes: model.size_bytes,
            format: model.format,
            created_at: at,
            modified_at: at,
        };

        self.ctx
            .write("model.create", |tx| {
                let conn = tx.conn()?;
                if model_exists(&conn, &record.id)? {
                    return Err(RepositoryError::Duplicate {
                        entity: "model",
                        key: record.id.clone(),
                    });
                }
                insert_model(&conn, &record).map_err(|e| duplicate_on_constraint(e, &record.id))?;
                search::write_index(&conn, &record.id)?;
                self.ctx.invalidate_on_write(
                    tx,
                    vec![
                        key_prefix(MODEL_FAMILY, &record.id),
                        family_prefix(MODEL_FAMILY) + "count",
                    ],
                );
                search::invalidate_results(&self.ctx, tx);
                Ok(())
            })
            .map_err(|e| e.context("model.create", &record.id))?;

        tracing::info!(
            model_id = %record.id,
            name = %record.name,
            format = %record.format,
            "Created model"
        );

        Ok(record.id)
    }

    /// Read a model; `None` if it does not exist
    pub fn read(&self, id: &str) -> Result<Option<ModelRecord>> {
        let key = cache_key(MODEL_FAMILY, id, "record");
        self.ctx
            .cached("model.read", &key, |tx| Ok(load_model(&*tx.conn()?, id)?))
            .map_err(|e| e.context("model.read", id))
    }

    /// Apply `update` and return the updated record
    pub fn update(&self, id: &str, update: ModelUpdate) -> Result<ModelRecord> {
        let update = update.normalized()?;

        let record = self
            .ctx
            .write("model.update", |tx| {
                let conn = tx.conn()?;
                let mut record =
                    load_model(&conn, id)?.ok_or_else(|| RepositoryError::MissingModel(id.to_string()))?;
                update.clone().apply(&mut record);
                record.modified_at = now().max(record.modified_at);

                conn.execute(
                    "UPDATE models
                     SET name = ?2, file_path = ?3, content_hash = ?4, size_bytes = ?5,
                         format = ?6, modified_at = ?7
                     WHERE id = ?1",
                    params![
                        record.id,
                        record.name,
                        record.file_path,
                        record.content_hash,
                        record.size_bytes as i64,
                        record.format,
                        to_micros(record.modified_at),
                    ],
                )?;
                search::write_index(&conn, id)?;

                self.ctx.invalidate_on_write(
                    tx,
                    vec![key_prefix(MODEL_FAMILY, id), family_prefix(PROJECT_FAMILY)],
                );
                search::invalidate_results(&self.ctx, tx);
                Ok(record)
            })
            .map_err(|e| e.context("model.update", id))?;

        tracing::info!(model_id = %id, "Updated model");
        Ok(record)
    }

    /// Delete a model with its metadata, index rows and project links.
    /// Returns false if it did not exist.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let deleted = self
            .ctx
            .write("model.delete", |tx| {
                let removed = tx.conn()?.execute("DELETE FROM models WHERE id = ?1", [id])?;
                if removed > 0 {
                    self.ctx.invalidate_on_write(
                        tx,
                        vec![
                            key_prefix(MODEL_FAMILY, id),
                            family_prefix(MODEL_FAMILY) + "count",
                            key_prefix(METADATA_FAMILY, id),
                            family_prefix(PROJECT_FAMILY),
                        ],
                    );
                    search::invalidate_results(&self.ctx, tx);
                }
                Ok(removed > 0)
            })
            .map_err(|e| e.context("model.delete", id))?;

        if deleted {
            tracing::info!(model_id = %id, "Deleted model");
        }
        Ok(deleted)
    }

    pub fn list(&self, options: &ListOptions) -> Result<Vec<ModelRecord>> {
        let order = match options.order {
            ListOrder::Name => "m.name COLLATE NOCASE ASC, m.id ASC",
            ListOrder::RecentlyModified => "m.modified_at DESC, m.id ASC",
            ListOrder::Created => "m.created_at ASC, m.id ASC",
        };
        let (limit, offset) = options.limit_offset();

        self.ctx.read("model.list", |tx| {
            let conn = tx.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {MODEL_COLUMNS} FROM models m ORDER BY {order} LIMIT ?1 OFFSET ?2"
            ))?;
            let models = stmt
                .query_map(params![limit, offset], ModelRecord::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(models)
        })
    }

    /// Models matching `text`, best match first
    pub fn search(&self, text: &str) -> Result<Vec<ModelRecord>> {
        Ok(self
            .search
            .search(&SearchQuery::text(text))?
            .into_iter()
            .map(|hit| hit.model)
            .collect())
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.read(id)?.is_some())
    }

    pub fn count(&self) -> Result<u64> {
        let key = family_prefix(MODEL_FAMILY) + "count";
        let count = self.ctx.cached("model.count", &key, |tx| {
            let count: i64 = tx
                .conn()?
                .query_row("SELECT COUNT(*) FROM models", [], |row| row.get(0))?;
            Ok(Some(count))
        })?;
        Ok(count.map_or(0, |c| c as u64))
    }
}

impl Clone for ModelRepository {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            search: self.search.clone(),
        }
    }
}

pub(crate) fn load_model(conn: &Connection, id: &str) -> Result<Option<ModelRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {MODEL_COLUMNS} FROM models m WHERE m.id = ?1"),
            [id],
            ModelRecord::from_row,
        )
        .optional()?)
}

pub(crate) fn model_exists(conn: &Connection, id: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM models WHERE id = ?1", [id], |_| Ok(()))
        .optional()?
        .is_some())
}

fn insert_model(conn: &Connection, record: &ModelRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO models
         (id, name, file_path, content_hash, size_bytes, format, created_at, modified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id,
            record.name,
            record.file_path,
            record.content_hash,
            record.size_bytes as i64,
            record.format,
            to_micros(record.created_at),
            to_micros(record.modified_at),
        ],
    )?;
    Ok(())
}

fn duplicate_on_constraint(error: RepositoryError, id: &str) -> RepositoryError {
    match error.storage_kind() {
        Some(ErrorKind::Constraint) => RepositoryError::Duplicate {
            entity: "model",
            key: id.to_string(),
        },
        _ => error,
    }
}
