//! meshvault Cache
//!
//! Two-tier LRU cache (memory + secondary) with exact byte accounting and
//! epoch-checked publication for read-through loaders.

mod error;
mod key;
mod manager;
mod tier;

pub use error::CacheError;
pub use key::{cache_key, family_prefix, key_prefix};
pub use manager::{CacheConfig, CacheManager, CacheStats, LoadTicket};

pub type Result<T> = std::result::Result<T, CacheError>;
