//! Search repository
//!
//! The `search_index` table holds lower-cased `(model_id, field, value)` rows
//! derived from each model and its metadata:
//!
//! | field        | value                         |
//! |--------------|-------------------------------|
//! | `name`       | model name                    |
//! | `path`       | full file path                |
//! | `stem`       | file name without extension   |
//! | `format`     | format tag                    |
//! | `hash`       | content hash                  |
//! | `meta:<key>` | each scalar in the value      |
//! | `tag`        | each tag of the `tags` entry  |
//!
//! The index is always rebuildable from models and metadata.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

use meshvault_cache::{cache_key, family_prefix};
use meshvault_storage::{CancelToken, Transaction};

use crate::context::RepositoryContext;
use crate::error::RepositoryError;
use crate::models::{
    normalize_format, to_micros, DuplicateGroup, MetadataEntry, ModelRecord, MODEL_COLUMNS,
    TAGS_KEY,
};
use crate::Result;

pub(crate) const SEARCH_FAMILY: &str = "search";

/// Exact match of the query against an indexed value
pub const RANK_EXACT: u8 = 2;
/// Query found inside an indexed value
pub const RANK_PARTIAL: u8 = 1;
/// No text query; the model matched on filters alone
pub const RANK_FILTER: u8 = 0;

/// Text query plus filters; all filters must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: Option<String>,
    /// Every listed tag must be present
    pub tags: Vec<String>,
    /// Any listed format matches
    pub formats: Vec<String>,
    /// Inclusive lower bound on `modified_at`
    pub modified_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `modified_at`
    pub modified_before: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub limit: Option<u32>,
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.formats.push(format.into());
        self
    }

    pub fn modified_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.modified_after = after;
        self.modified_before = before;
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Canonical form; equal queries produce equal cache signatures
    fn normalized(&self) -> Result<SearchQuery> {
        let mut tags: Vec<String> = self
            .tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        tags.sort();
        tags.dedup();

        let mut formats = self
            .formats
            .iter()
            .map(|f| normalize_format(f))
            .collect::<Result<Vec<_>>>()?;
        formats.sort();
        formats.dedup();

        Ok(SearchQuery {
            text: self
                .text
                .as_deref()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty()),
            tags,
            formats,
            modified_after: self.modified_after,
            modified_before: self.modified_before,
            content_hash: self
                .content_hash
                .as_deref()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty()),
            limit: self.limit,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub model: ModelRecord,
    /// [`RANK_EXACT`], [`RANK_PARTIAL`] or [`RANK_FILTER`]
    pub rank: u8,
}

pub struct SearchRepository {
    ctx: RepositoryContext,
}

impl SearchRepository {
    pub fn new(ctx: RepositoryContext) -> Self {
        Self { ctx }
    }

    /// Ranked search. Exact matches come first, then partial matches; ties
    /// are broken by most recent modification, then id.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let query = query.normalized()?;
        let key = cache_key(SEARCH_FAMILY, &serde_json::to_string(&query)?, "hits");

        let hits = self.ctx.cached("search.query", &key, |tx| {
            let conn = tx.conn()?;
            Ok(Some(run_query(&conn, &query)?))
        })?;
        Ok(hits.unwrap_or_default())
    }

    pub fn count(&self, query: &SearchQuery) -> Result<usize> {
        let query = SearchQuery {
            limit: None,
            ..query.clone()
        };
        Ok(self.search(&query)?.len())
    }

    pub fn exists(&self, query: &SearchQuery) -> Result<bool> {
        Ok(!self.search(&query.clone().limit(1))?.is_empty())
    }

    /// Groups of models sharing a content hash, ordered by hash
    pub fn find_duplicates(&self) -> Result<Vec<DuplicateGroup>> {
        let key = cache_key(SEARCH_FAMILY, "duplicates", "groups");
        let groups = self.ctx.cached("search.duplicates", &key, |tx| {
            let conn = tx.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {MODEL_COLUMNS} FROM models m
                 WHERE m.content_hash IN (
                     SELECT content_hash FROM models GROUP BY content_hash HAVING COUNT(*) > 1
                 )
                 ORDER BY m.content_hash, m.created_at, m.id"
            ))?;
            let models = stmt
                .query_map([], ModelRecord::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut groups: Vec<DuplicateGroup> = Vec::new();
            for model in models {
                match groups.last_mut() {
                    Some(group) if group.content_hash == model.content_hash => {
                        group.models.push(model)
                    }
                    _ => groups.push(DuplicateGroup {
                        content_hash: model.content_hash.clone(),
                        models: vec![model],
                    }),
                }
            }
            Ok(Some(groups))
        })?;
        Ok(groups.unwrap_or_default())
    }

    /// Recompute the index rows of one model. Returns false if it does not exist.
    pub fn reindex(&self, model_id: &str) -> Result<bool> {
        self.ctx
            .write("search.reindex", |tx| {
                let found = write_index(&*tx.conn()?, model_id)?;
                if found {
                    self.ctx
                        .invalidate_on_write(tx, vec![family_prefix(SEARCH_FAMILY)]);
                }
                Ok(found)
            })
            .map_err(|e| e.context("search.reindex", model_id))
    }

    /// Recompute the whole index. Returns the number of models indexed.
    pub fn rebuild_index(&self) -> Result<usize> {
        self.rebuild_index_with_cancel(&CancelToken::new())
    }

    /// Recompute the whole index, checking `cancel` between models.
    ///
    /// A cancelled rebuild rolls back and leaves the previous index intact.
    pub fn rebuild_index_with_cancel(&self, cancel: &CancelToken) -> Result<usize> {
        let indexed = self.ctx.write("search.rebuild", |tx| {
            let ids: Vec<String> = {
                let conn = tx.conn()?;
                conn.execute("DELETE FROM search_index", [])?;
                let mut stmt = conn.prepare("SELECT id FROM models ORDER BY id")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                ids
            };

            for (done, id) in ids.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(RepositoryError::Cancelled { indexed: done });
                }
                write_index(&*tx.conn()?, id)?;
            }

            self.ctx
                .invalidate_on_write(tx, vec![family_prefix(SEARCH_FAMILY)]);
            Ok(ids.len())
        })?;

        tracing::info!(models = indexed, "Rebuilt search index");
        Ok(indexed)
    }
}

impl Clone for SearchRepository {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

/// Replace the index rows of `model_id`. Returns false if the model is missing.
pub(crate) fn write_index(conn: &Connection, model_id: &str) -> Result<bool> {
    conn.execute("DELETE FROM search_index WHERE model_id = ?1", [model_id])?;

    let model = conn
        .query_row(
            &format!("SELECT {MODEL_COLUMNS} FROM models m WHERE m.id = ?1"),
            [model_id],
            ModelRecord::from_row,
        )
        .optional()?;
    let Some(model) = model else {
        return Ok(false);
    };

    let mut rows: Vec<(String, String)> = vec![
        ("name".into(), model.name.to_lowercase()),
        ("path".into(), model.file_path.to_lowercase()),
        ("format".into(), model.format.clone()),
        ("hash".into(), model.content_hash.clone()),
    ];
    if let Some(stem) = Path::new(&model.file_path).file_stem() {
        rows.push(("stem".into(), stem.to_string_lossy().to_lowercase()));
    }

    let mut stmt = conn.prepare(
        "SELECT model_id, key, value_type, value, updated_at FROM metadata WHERE model_id = ?1",
    )?;
    let entries = stmt
        .query_map([model_id], MetadataEntry::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for entry in entries {
        if entry.key == TAGS_KEY {
            rows.extend(entry.value.as_tags().into_iter().map(|t| ("tag".to_string(), t)));
        }
        let field = format!("meta:{}", entry.key);
        rows.extend(
            entry
                .value
                .search_terms()
                .into_iter()
                .map(|term| (field.clone(), term)),
        );
    }

    let mut insert =
        conn.prepare("INSERT INTO search_index (model_id, field, value) VALUES (?1, ?2, ?3)")?;
    for (field, value) in rows {
        insert.execute(params![model_id, field, value])?;
    }
    Ok(true)
}

fn run_query(conn: &Connection, query: &SearchQuery) -> Result<Vec<SearchHit>> {
    let mut params: Vec<Value> = Vec::new();
    let mut filters: Vec<String> = Vec::new();

    if !query.formats.is_empty() {
        let placeholders = vec!["?"; query.formats.len()].join(", ");
        filters.push(format!("m.format IN ({placeholders})"));
        params.extend(query.formats.iter().cloned().map(Value::Text));
    }
    if let Some(after) = query.modified_after {
        filters.push("m.modified_at >= ?".into());
        params.push(Value::Integer(to_micros(after)));
    }
    if let Some(before) = query.modified_before {
        filters.push("m.modified_at < ?".into());
        params.push(Value::Integer(to_micros(before)));
    }
    if let Some(hash) = &query.content_hash {
        filters.push("m.content_hash = ?".into());
        params.push(Value::Text(hash.clone()));
    }
    for tag in &query.tags {
        filters.push(
            "EXISTS (SELECT 1 FROM search_index t
                     WHERE t.model_id = m.id AND t.field = 'tag' AND t.value = ?)"
                .into(),
        );
        params.push(Value::Text(tag.clone()));
    }

    let limit = query.limit.map(i64::from).unwrap_or(-1);

    let sql = match &query.text {
        Some(text) => {
            let mut all_params = vec![
                Value::Text(text.clone()),
                Value::Text(text.clone()),
                Value::Text(format!("%{}%", escape_like(text))),
            ];
            all_params.append(&mut params);
            params = all_params;

            let mut clauses = vec!["(s.value = ? OR s.value LIKE ? ESCAPE '\\')".to_string()];
            clauses.extend(filters);
            format!(
                "SELECT {MODEL_COLUMNS},
                        MAX(CASE WHEN s.value = ? THEN {RANK_EXACT} ELSE {RANK_PARTIAL} END) AS rank
                 FROM models m
                 JOIN search_index s ON s.model_id = m.id
                 WHERE {}
                 GROUP BY m.id
                 ORDER BY rank DESC, m.modified_at DESC, m.id ASC
                 LIMIT ?",
                clauses.join(" AND ")
            )
        }
        None => {
            let clause = if filters.is_empty() {
                "1 = 1".to_string()
            } else {
                filters.join(" AND ")
            };
            format!(
                "SELECT {MODEL_COLUMNS}, {RANK_FILTER} AS rank
                 FROM models m
                 WHERE {clause}
                 ORDER BY m.modified_at DESC, m.id ASC
                 LIMIT ?"
            )
        }
    };
    params.push(Value::Integer(limit));

    let mut stmt = conn.prepare(&sql)?;
    let hits = stmt
        .query_map(params_from_iter(params), |row| {
            Ok(SearchHit {
                model: ModelRecord::from_row(row)?,
                rank: row.get(8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(hits)
}

/// Escape LIKE wildcards for use with `ESCAPE '\'`
pub(crate) fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Invalidate every cached search result once `tx` writes models or metadata
pub(crate) fn invalidate_results(ctx: &RepositoryContext, tx: &Transaction<'_>) {
    ctx.invalidate_on_write(tx, vec![family_prefix(SEARCH_FAMILY)]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing;
    use crate::metadata::MetadataRepository;
    use crate::model::ModelRepository;
    use crate::models::{MetadataValue, ModelUpdate, NewModel};
    use serde_json::json;

    struct Fixture {
        models: ModelRepository,
        metadata: MetadataRepository,
        search: SearchRepository,
    }

    fn fixture() -> Fixture {
        let ctx = testing::context();
        Fixture {
            models: ModelRepository::new(ctx.clone()),
            metadata: MetadataRepository::new(ctx.clone()),
            search: SearchRepository::new(ctx),
        }
    }

    fn ids(hits: &[SearchHit]) -> Vec<String> {
        hits.iter().map(|h| h.model.id.clone()).collect()
    }

    #[test]
    fn test_exact_match_ranks_above_partial() {
        let f = fixture();
        let partial = f
            .models
            .create(NewModel::new("Chair Leg", "/a/chair_leg.obj", "aa01", 10, "obj"))
            .unwrap();
        let exact = f
            .models
            .create(NewModel::new("Chair", "/a/chair.obj", "aa02", 10, "obj"))
            .unwrap();
        // Touch the partial match last so recency alone would put it first
        f.models
            .update(&partial, ModelUpdate {
                size_bytes: Some(11),
                ..ModelUpdate::default()
            })
            .unwrap();

        let hits = f.search.search(&SearchQuery::text("CHAIR")).unwrap();
        assert_eq!(ids(&hits), vec![exact.clone(), partial]);
        assert_eq!(hits[0].rank, RANK_EXACT);
        assert_eq!(hits[1].rank, RANK_PARTIAL);
    }

    #[test]
    fn test_ties_break_by_recency_then_id() {
        let f = fixture();
        let older = f
            .models
            .create(NewModel::new("Lamp A", "/lamp_a.stl", "bb01", 1, "stl"))
            .unwrap();
        let newer = f
            .models
            .create(NewModel::new("Lamp B", "/lamp_b.stl", "bb02", 1, "stl"))
            .unwrap();
        f.models
            .update(&newer, ModelUpdate {
                name: Some("Lamp B2".into()),
                ..ModelUpdate::default()
            })
            .unwrap();

        let hits = f.search.search(&SearchQuery::text("lamp")).unwrap();
        assert_eq!(ids(&hits), vec![newer, older]);
    }

    #[test]
    fn test_metadata_and_tags_are_searchable() {
        let f = fixture();
        let id = f
            .models
            .create(NewModel::new("Rover", "/vehicles/rover.gltf", "cc01", 5, "gltf"))
            .unwrap();
        let other = f
            .models
            .create(NewModel::new("Tree", "/nature/tree.gltf", "cc02", 5, "gltf"))
            .unwrap();
        f.metadata.add(&id, "author", "Grace".into()).unwrap();
        f.metadata
            .add(&id, TAGS_KEY, MetadataValue::Nested(json!(["Vehicle", "SciFi"])))
            .unwrap();
        f.metadata.add(&other, TAGS_KEY, "nature".into()).unwrap();

        assert_eq!(ids(&f.search.search(&SearchQuery::text("grace")).unwrap()), vec![id.clone()]);

        let tagged = f
            .search
            .search(&SearchQuery::default().with_tag("vehicle").with_tag("scifi"))
            .unwrap();
        assert_eq!(ids(&tagged), vec![id.clone()]);
        assert_eq!(tagged[0].rank, RANK_FILTER);

        assert!(f
            .search
            .search(&SearchQuery::default().with_tag("vehicle").with_tag("nature"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_filters_combine() {
        let f = fixture();
        let stl = f
            .models
            .create(NewModel::new("Gear", "/gear.stl", "dd01", 1, "stl"))
            .unwrap();
        let obj = f
            .models
            .create(NewModel::new("Gear", "/gear.obj", "dd02", 1, "obj"))
            .unwrap();

        let by_format = f
            .search
            .search(&SearchQuery::text("gear").with_format("STL"))
            .unwrap();
        assert_eq!(ids(&by_format), vec![stl.clone()]);

        let by_hash = f
            .search
            .search(&SearchQuery::default().with_content_hash("DD02"))
            .unwrap();
        assert_eq!(ids(&by_hash), vec![obj.clone()]);

        let created = f.models.read(&obj).unwrap().unwrap().modified_at;
        let window = f
            .search
            .search(&SearchQuery::default().modified_between(Some(created), None))
            .unwrap();
        assert!(ids(&window).contains(&obj));
        let before = f
            .search
            .search(&SearchQuery::default().modified_between(None, Some(created)))
            .unwrap();
        assert!(!ids(&before).contains(&obj));
    }

    #[test]
    fn test_like_wildcards_are_literal() {
        let f = fixture();
        f.models
            .create(NewModel::new("part_100", "/part_100.stl", "ee01", 1, "stl"))
            .unwrap();
        f.models
            .create(NewModel::new("partX100", "/partX100.stl", "ee02", 1, "stl"))
            .unwrap();

        let hits = f.search.search(&SearchQuery::text("t_1")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].model.name, "part_100");
    }

    #[test]
    fn test_results_are_cached_and_invalidated_by_writes() {
        let f = fixture();
        f.models
            .create(NewModel::new("Bolt", "/bolt.stl", "ff01", 1, "stl"))
            .unwrap();
        let query = SearchQuery::text("bolt");

        assert_eq!(f.search.count(&query).unwrap(), 1);
        let misses = f.search.ctx.cache().stats().misses;
        assert_eq!(f.search.count(&query).unwrap(), 1);
        assert_eq!(f.search.ctx.cache().stats().misses, misses);

        f.models
            .create(NewModel::new("Bolt M4", "/bolt_m4.stl", "ff02", 1, "stl"))
            .unwrap();
        assert_eq!(f.search.count(&query).unwrap(), 2);
        assert!(f.search.exists(&query).unwrap());
    }

    #[test]
    fn test_find_duplicates_groups_by_hash() {
        let f = fixture();
        let a = f
            .models
            .create(NewModel::new("A", "/a.stl", "abc", 1, "stl"))
            .unwrap();
        let b = f
            .models
            .create(NewModel::new("B", "/copy/a.stl", "abc", 1, "stl"))
            .unwrap();
        f.models
            .create(NewModel::new("C", "/c.stl", "def", 1, "stl"))
            .unwrap();

        let groups = f.search.find_duplicates().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].content_hash, "abc");
        let mut found: Vec<String> = groups[0].models.iter().map(|m| m.id.clone()).collect();
        found.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_rebuild_matches_incremental_index() {
        let f = fixture();
        let id = f
            .models
            .create(NewModel::new("Anvil", "/tools/anvil.obj", "ab12", 1, "obj"))
            .unwrap();
        f.metadata.add(&id, TAGS_KEY, "tools, heavy".into()).unwrap();

        let snapshot = |f: &Fixture| -> Vec<(String, String, String)> {
            f.search
                .ctx
                .read("test.snapshot", |tx| {
                    let conn = tx.conn()?;
                    let mut stmt = conn.prepare(
                        "SELECT model_id, field, value FROM search_index ORDER BY 1, 2, 3",
                    )?;
                    let rows = stmt
                        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows)
                })
                .unwrap()
        };

        let incremental = snapshot(&f);
        assert!(incremental.contains(&(id.clone(), "stem".into(), "anvil".into())));
        assert!(incremental.contains(&(id.clone(), "tag".into(), "heavy".into())));

        assert_eq!(f.search.rebuild_index().unwrap(), 1);
        assert_eq!(snapshot(&f), incremental);
    }

    #[test]
    fn test_cancelled_rebuild_keeps_previous_index() {
        let f = fixture();
        f.models
            .create(NewModel::new("Cog", "/cog.stl", "ac01", 1, "stl"))
            .unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            f.search.rebuild_index_with_cancel(&cancel),
            Err(RepositoryError::Cancelled { indexed: 0 })
        ));
        assert_eq!(f.search.count(&SearchQuery::text("cog")).unwrap(), 1);
    }

    #[test]
    fn test_reindex_missing_model() {
        let f = fixture();
        assert!(!f.search.reindex("nope").unwrap());
    }
}
