//! Records stored by the repositories

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::error::RepositoryError;
use crate::Result;

const MAX_NAME_LEN: usize = 255;

/// Metadata key whose values are treated as tags
pub const TAGS_KEY: &str = "tags";

pub(crate) const MODEL_COLUMNS: &str =
    "m.id, m.name, m.file_path, m.content_hash, m.size_bytes, m.format, m.created_at, m.modified_at";

pub(crate) const PROJECT_COLUMNS: &str = "id, name, description, created_at, modified_at";

/// A tracked 3D model file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Stable identifier, independent of file content
    pub id: String,
    pub name: String,
    pub file_path: String,
    /// Content hash of the file; several models may share one
    pub content_hash: String,
    pub size_bytes: u64,
    /// Lower-case format tag such as `stl` or `gltf`
    pub format: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ModelRecord {
    /// Map a row selected with [`MODEL_COLUMNS`]
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            file_path: row.get(2)?,
            content_hash: row.get(3)?,
            size_bytes: u64::try_from(row.get::<_, i64>(4)?).unwrap_or_default(),
            format: row.get(5)?,
            created_at: from_micros(row.get(6)?),
            modified_at: from_micros(row.get(7)?),
        })
    }
}

/// Fields for a new model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewModel {
    pub name: String,
    pub file_path: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub format: String,
}

impl NewModel {
    pub fn new(
        name: impl Into<String>,
        file_path: impl Into<String>,
        content_hash: impl Into<String>,
        size_bytes: u64,
        format: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            file_path: file_path.into(),
            content_hash: content_hash.into(),
            size_bytes,
            format: format.into(),
        }
    }

    /// Validate and normalise every field
    pub(crate) fn normalized(&self) -> Result<NewModel> {
        Ok(NewModel {
            name: normalize_name("name", &self.name)?,
            file_path: normalize_path(&self.file_path)?,
            content_hash: normalize_hash(&self.content_hash)?,
            size_bytes: check_size(self.size_bytes)?,
            format: normalize_format(&self.format)?,
        })
    }
}

/// Partial update of a model; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub name: Option<String>,
    pub file_path: Option<String>,
    pub content_hash: Option<String>,
    pub size_bytes: Option<u64>,
    pub format: Option<String>,
}

impl ModelUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.file_path.is_none()
            && self.content_hash.is_none()
            && self.size_bytes.is_none()
            && self.format.is_none()
    }

    pub(crate) fn normalized(&self) -> Result<ModelUpdate> {
        if self.is_empty() {
            return Err(RepositoryError::validation("update", "no fields to update"));
        }
        Ok(ModelUpdate {
            name: self.name.as_deref().map(|n| normalize_name("name", n)).transpose()?,
            file_path: self.file_path.as_deref().map(normalize_path).transpose()?,
            content_hash: self.content_hash.as_deref().map(normalize_hash).transpose()?,
            size_bytes: self.size_bytes.map(check_size).transpose()?,
            format: self.format.as_deref().map(normalize_format).transpose()?,
        })
    }

    pub(crate) fn apply(self, record: &mut ModelRecord) {
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(file_path) = self.file_path {
            record.file_path = file_path;
        }
        if let Some(content_hash) = self.content_hash {
            record.content_hash = content_hash;
        }
        if let Some(size_bytes) = self.size_bytes {
            record.size_bytes = size_bytes;
        }
        if let Some(format) = self.format {
            record.format = format;
        }
    }
}

/// Typed metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MetadataValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Nested(serde_json::Value),
}

impl MetadataValue {
    pub fn type_tag(&self) -> &'static str {
        match self {
            MetadataValue::Text(_) => "text",
            MetadataValue::Number(_) => "number",
            MetadataValue::Bool(_) => "bool",
            MetadataValue::Nested(_) => "nested",
        }
    }

    /// Stored text form; the type tag is kept in its own column
    pub(crate) fn encode(&self) -> Result<String> {
        Ok(match self {
            MetadataValue::Text(text) => text.clone(),
            MetadataValue::Number(n) => n.to_string(),
            MetadataValue::Bool(b) => b.to_string(),
            MetadataValue::Nested(value) => serde_json::to_string(value)?,
        })
    }

    pub(crate) fn decode(
        type_tag: &str,
        raw: &str,
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(match type_tag {
            "text" => MetadataValue::Text(raw.to_string()),
            "number" => MetadataValue::Number(raw.parse()?),
            "bool" => MetadataValue::Bool(raw.parse()?),
            "nested" => MetadataValue::Nested(serde_json::from_str(raw)?),
            other => return Err(format!("unknown metadata type '{other}'").into()),
        })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            MetadataValue::Number(n) if !n.is_finite() => {
                Err(RepositoryError::validation("value", "numbers must be finite"))
            }
            _ => Ok(()),
        }
    }

    /// Lower-cased scalar texts used by the search index
    pub(crate) fn search_terms(&self) -> Vec<String> {
        let mut terms = Vec::new();
        match self {
            MetadataValue::Text(text) => terms.push(text.to_lowercase()),
            MetadataValue::Number(n) => terms.push(n.to_string()),
            MetadataValue::Bool(b) => terms.push(b.to_string()),
            MetadataValue::Nested(value) => collect_scalars(value, &mut terms),
        }
        terms.retain(|t| !t.trim().is_empty());
        terms
    }

    /// Tags carried by a `tags` entry: a JSON array of strings or comma-separated text
    pub fn as_tags(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            MetadataValue::Text(text) => text.split(',').collect(),
            MetadataValue::Nested(serde_json::Value::Array(items)) => {
                items.iter().filter_map(serde_json::Value::as_str).collect()
            }
            _ => Vec::new(),
        };

        let mut tags: Vec<String> = raw
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }
}

impl From<&str> for MetadataValue {
    fn from(text: &str) -> Self {
        MetadataValue::Text(text.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(text: String) -> Self {
        MetadataValue::Text(text)
    }
}

impl From<f64> for MetadataValue {
    fn from(n: f64) -> Self {
        MetadataValue::Number(n)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

impl From<serde_json::Value> for MetadataValue {
    fn from(value: serde_json::Value) -> Self {
        MetadataValue::Nested(value)
    }
}

fn collect_scalars(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.to_lowercase()),
        serde_json::Value::Number(n) => out.push(n.to_string()),
        serde_json::Value::Bool(b) => out.push(b.to_string()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_scalars(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_scalars(v, out)),
        serde_json::Value::Null => {}
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub model_id: String,
    pub key: String,
    pub value: MetadataValue,
    pub updated_at: DateTime<Utc>,
}

impl MetadataEntry {
    /// Map a `model_id, key, value_type, value, updated_at` row
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let type_tag: String = row.get(2)?;
        let raw: String = row.get(3)?;
        let value = MetadataValue::decode(&type_tag, &raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e))?;

        Ok(Self {
            model_id: row.get(0)?,
            key: row.get(1)?,
            value,
            updated_at: from_micros(row.get(4)?),
        })
    }
}

/// A named collection of models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    /// Unique, compared case-insensitively
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Project {
    /// Map a row selected with [`PROJECT_COLUMNS`]
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            created_at: from_micros(row.get(3)?),
            modified_at: from_micros(row.get(4)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub description: Option<String>,
}

impl NewProject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    /// `Some(None)` clears the description
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOrder {
    #[default]
    Name,
    RecentlyModified,
    Created,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub limit: Option<u32>,
    pub offset: u32,
    pub order: ListOrder,
}

impl ListOptions {
    pub fn ordered(order: ListOrder) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    /// `LIMIT`/`OFFSET` values; SQLite treats a negative limit as unbounded
    pub(crate) fn limit_offset(&self) -> (i64, i64) {
        (
            self.limit.map(i64::from).unwrap_or(-1),
            i64::from(self.offset),
        )
    }
}

/// Models sharing one content hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub content_hash: String,
    /// Oldest first
    pub models: Vec<ModelRecord>,
}

pub(crate) fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// Current time truncated to the stored precision
pub(crate) fn now() -> DateTime<Utc> {
    from_micros(to_micros(Utc::now()))
}

pub(crate) fn normalize_name(field: &'static str, name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RepositoryError::validation(field, "cannot be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(RepositoryError::validation(
            field,
            format!("longer than {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(name.to_string())
}

fn normalize_path(path: &str) -> Result<String> {
    let path = path.trim();
    if path.is_empty() {
        return Err(RepositoryError::validation("file_path", "cannot be empty"));
    }
    Ok(path.to_string())
}

fn normalize_hash(hash: &str) -> Result<String> {
    let hash = hash.trim();
    if hash.is_empty() {
        return Err(RepositoryError::validation("content_hash", "cannot be empty"));
    }
    if !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RepositoryError::validation(
            "content_hash",
            "must be alphanumeric",
        ));
    }
    Ok(hash.to_ascii_lowercase())
}

pub(crate) fn normalize_format(format: &str) -> Result<String> {
    let format = format.trim().trim_start_matches('.').to_ascii_lowercase();
    if format.is_empty() {
        return Err(RepositoryError::validation("format", "cannot be empty"));
    }
    if !format.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RepositoryError::validation(
            "format",
            format!("'{format}' is not a format tag"),
        ));
    }
    Ok(format)
}

fn check_size(size: u64) -> Result<u64> {
    if i64::try_from(size).is_err() {
        return Err(RepositoryError::validation("size_bytes", "too large"));
    }
    Ok(size)
}

pub(crate) fn normalize_key(key: &str) -> Result<String> {
    let key = key.trim();
    if key.is_empty() {
        return Err(RepositoryError::validation("key", "cannot be empty"));
    }
    Ok(key.to_string())
}
