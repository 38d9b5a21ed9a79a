//! Store configuration
//!
//! Configuration is loaded from:
//! 1. Default values (rooted at the per-platform data directory)
//! 2. A TOML file
//! 3. Environment variables (`MESHVAULT_*` prefix)
//!
//! Environment variables take precedence over file values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use meshvault_cache::CacheConfig;
use meshvault_health::HealthConfig;
use meshvault_storage::RetryPolicy;

use crate::error::CoreError;
use crate::Result;

const ENV_PREFIX: &str = "MESHVAULT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the store file
    pub database_path: PathBuf,
    /// How long SQLite itself waits on a busy file before reporting a lock
    pub busy_timeout_ms: u64,
    /// Run the health monitor's background sampler
    pub start_monitor: bool,
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    pub health: HealthConfig,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            database_path: data_dir.join("meshvault.db"),
            busy_timeout_ms: 250,
            start_monitor: true,
            cache: CacheConfig {
                secondary_dir: Some(data_dir.join("cache")),
                ..CacheConfig::default()
            },
            retry: RetryPolicy::default(),
            health: HealthConfig::default(),
        }
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("meshvault"))
            .unwrap_or_else(|| PathBuf::from(".meshvault"))
    }

    /// Load from the default config file, if any, plus the environment
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific file.
    ///
    /// A missing file means defaults; environment overrides still apply.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::parse(&content)
                .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            Self::default()
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn load_from_str(content: &str) -> Result<Self> {
        let mut config = Self::parse(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Config file location, overridable with `MESHVAULT_CONFIG`
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .map(|d| d.join("meshvault"))
            .unwrap_or_else(|| PathBuf::from(".meshvault"))
            .join("config.toml")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }

    fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `MESHVAULT_*` overrides looked up through `var`
    fn apply_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = var(&format!("{}_DATABASE_PATH", ENV_PREFIX)) {
            self.database_path = PathBuf::from(path);
        }

        if let Some(bytes) = byte_override(&var, "MEMORY_CACHE_BYTES")? {
            self.cache.memory_ceiling_bytes = bytes;
        }

        if let Some(bytes) = byte_override(&var, "SECONDARY_CACHE_BYTES")? {
            self.cache.secondary_ceiling_bytes = bytes;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

fn byte_override<F>(var: &F, suffix: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    let name = format!("{}_{}", ENV_PREFIX, suffix);
    match var(&name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CoreError::Config(format!("{} must be a byte count, got '{}'", name, raw))),
    }
}
