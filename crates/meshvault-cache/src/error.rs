//! Cache error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to prepare cache directory '{path}': {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write cache entry '{key}': {source}")]
    Write {
        key: String,
        #[source]
        source: std::io::Error,
    },
}
