//! meshvault Repositories
//!
//! Data access for models, metadata, search and projects. Each call runs in
//! a transaction (or joins the caller's), reads through the cache and reports
//! its timing to the health monitor.

mod context;
mod error;
mod metadata;
mod model;
mod models;
mod project;
mod search;

pub use context::RepositoryContext;
pub use error::RepositoryError;
pub use metadata::MetadataRepository;
pub use model::ModelRepository;
pub use models::{
    DuplicateGroup, ListOptions, ListOrder, MetadataEntry, MetadataValue, ModelRecord,
    ModelUpdate, NewModel, NewProject, Project, ProjectUpdate, TAGS_KEY,
};
pub use project::ProjectRepository;
pub use search::{SearchHit, SearchQuery, SearchRepository, RANK_EXACT, RANK_FILTER, RANK_PARTIAL};

pub type Result<T> = std::result::Result<T, RepositoryError>;
