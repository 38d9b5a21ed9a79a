//! Two-tier cache manager
//!
//! Reads check the memory tier first, then the secondary tier, promoting
//! secondary hits into memory. Writes go to both tiers, each subject to its
//! own ceiling.
//!
//! Invalidation bumps a global epoch before removing entries. Readers that
//! loaded a value from the store take a [`LoadTicket`] before the load and
//! publish through [`CacheManager::put_if_fresh`], which refuses the value if
//! any invalidation happened in between.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::tier::{Backend, LruTier};
use crate::Result;

/// Cache sizing, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory_ceiling_bytes: u64,
    pub secondary_ceiling_bytes: u64,
    /// Directory for the secondary tier; kept in memory when unset
    pub secondary_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_bytes: 16 * 1024 * 1024,
            secondary_ceiling_bytes: 128 * 1024 * 1024,
            secondary_dir: None,
        }
    }
}

/// Snapshot of the invalidation epoch taken before loading from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    epoch: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hits served by the secondary tier (and promoted)
    pub secondary_hits: u64,
    pub evictions: u64,
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub memory_ceiling_bytes: u64,
    pub secondary_entries: usize,
    pub secondary_bytes: u64,
    pub secondary_ceiling_bytes: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit either tier, `None` before any lookup
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits + self.misses;
        if total == 0 {
            None
        } else {
            Some(self.hits as f64 / total as f64)
        }
    }
}

struct CacheState {
    memory: Mutex<LruTier>,
    secondary: Mutex<LruTier>,
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    secondary_hits: AtomicU64,
}

/// Cache manager
///
/// Lock order is always memory tier, then secondary tier.
pub struct CacheManager {
    config: Arc<CacheConfig>,
    state: Arc<CacheState>,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Result<Self> {
        let secondary_backend = match &config.secondary_dir {
            Some(dir) => Backend::disk(dir)?,
            None => Backend::memory(),
        };

        tracing::info!(
            memory_ceiling = config.memory_ceiling_bytes,
            secondary_ceiling = config.secondary_ceiling_bytes,
            secondary_dir = ?config.secondary_dir,
            "Cache initialized"
        );

        Ok(Self {
            state: Arc::new(CacheState {
                memory: Mutex::new(LruTier::new(Backend::memory(), config.memory_ceiling_bytes)),
                secondary: Mutex::new(LruTier::new(
                    secondary_backend,
                    config.secondary_ceiling_bytes,
                )),
                epoch: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                secondary_hits: AtomicU64::new(0),
            }),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        let mut memory = self.state.memory.lock();
        if let Some(value) = memory.get(key) {
            self.state.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        let promoted = {
            let mut secondary = self.state.secondary.lock();
            secondary.get(key)
        };

        match promoted {
            Some(value) => {
                if let Err(e) = memory.put(key, Arc::clone(&value)) {
                    tracing::warn!(key, error = %e, "Failed to promote cache entry");
                }
                self.state.hits.fetch_add(1, Ordering::Relaxed);
                self.state.secondary_hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.state.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `value` under `key` in both tiers
    pub fn put(&self, key: &str, value: Arc<[u8]>) -> Result<()> {
        let mut memory = self.state.memory.lock();
        let mut secondary = self.state.secondary.lock();
        Self::store(&mut memory, &mut secondary, key, value)
    }

    /// Take a ticket before loading a value from the store
    pub fn load_ticket(&self) -> LoadTicket {
        LoadTicket {
            epoch: self.state.epoch.load(Ordering::SeqCst),
        }
    }

    /// Store `value` only if nothing was invalidated since `ticket` was taken.
    ///
    /// Returns whether the value was published.
    pub fn put_if_fresh(&self, ticket: LoadTicket, key: &str, value: Arc<[u8]>) -> Result<bool> {
        let mut memory = self.state.memory.lock();
        let mut secondary = self.state.secondary.lock();
        if self.state.epoch.load(Ordering::SeqCst) != ticket.epoch {
            tracing::trace!(key, "Dropping stale cache load");
            return Ok(false);
        }
        Self::store(&mut memory, &mut secondary, key, value)?;
        Ok(true)
    }

    pub fn invalidate(&self, key: &str) {
        self.state.epoch.fetch_add(1, Ordering::SeqCst);
        let in_memory = self.state.memory.lock().remove(key);
        let in_secondary = self.state.secondary.lock().remove(key);
        if in_memory || in_secondary {
            tracing::debug!(key, "Invalidated cache entry");
        }
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.state.epoch.fetch_add(1, Ordering::SeqCst);
        let removed = self.state.memory.lock().remove_prefix(prefix)
            + self.state.secondary.lock().remove_prefix(prefix);
        if removed > 0 {
            tracing::debug!(prefix, removed, "Invalidated cache entries");
        }
        removed
    }

    pub fn invalidate_all(&self) {
        self.state.epoch.fetch_add(1, Ordering::SeqCst);
        let removed = self.state.memory.lock().clear() + self.state.secondary.lock().clear();
        tracing::info!(removed, "Cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let memory = self.state.memory.lock();
        let secondary = self.state.secondary.lock();
        CacheStats {
            hits: self.state.hits.load(Ordering::Relaxed),
            misses: self.state.misses.load(Ordering::Relaxed),
            secondary_hits: self.state.secondary_hits.load(Ordering::Relaxed),
            evictions: memory.evictions() + secondary.evictions(),
            memory_entries: memory.len(),
            memory_bytes: memory.used_bytes(),
            memory_ceiling_bytes: memory.ceiling(),
            secondary_entries: secondary.len(),
            secondary_bytes: secondary.used_bytes(),
            secondary_ceiling_bytes: secondary.ceiling(),
        }
    }

    fn store(
        memory: &mut LruTier,
        secondary: &mut LruTier,
        key: &str,
        value: Arc<[u8]>,
    ) -> Result<()> {
        let in_memory = memory.put(key, Arc::clone(&value))?;
        let in_secondary = secondary.put(key, value)?;
        if !in_memory && !in_secondary {
            tracing::debug!(key, "Value larger than both cache tiers; not cached");
        }
        Ok(())
    }
}

impl Clone for CacheManager {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache() -> CacheManager {
        CacheManager::new(CacheConfig {
            memory_ceiling_bytes: 20,
            secondary_ceiling_bytes: 100,
            secondary_dir: None,
        })
        .unwrap()
    }

    fn bytes(text: &str) -> Arc<[u8]> {
        Arc::from(text.as_bytes())
    }

    #[test]
    fn test_get_after_put() {
        let cache = small_cache();
        cache.put("model:1:record", bytes("hello")).unwrap();
        assert_eq!(cache.get("model:1:record").as_deref(), Some(&b"hello"[..]));
        assert!(cache.get("model:2:record").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), Some(0.5));
    }

    #[test]
    fn test_secondary_hit_is_promoted() {
        let cache = small_cache();
        cache.put("a", bytes("0123456789")).unwrap();
        cache.put("b", bytes("0123456789")).unwrap();
        // Evicts "a" from memory; the secondary tier still has it
        cache.put("c", bytes("0123456789")).unwrap();

        assert_eq!(cache.stats().memory_entries, 2);
        assert!(cache.get("a").is_some());

        let stats = cache.stats();
        assert_eq!(stats.secondary_hits, 1);
        assert!(stats.memory_bytes <= stats.memory_ceiling_bytes);
    }

    #[test]
    fn test_value_too_large_for_memory_lives_in_secondary() {
        let cache = small_cache();
        cache.put("big", bytes(&"x".repeat(50))).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.secondary_bytes, 50);

        // Promotion is skipped too, but the read still succeeds
        assert!(cache.get("big").is_some());
    }

    #[test]
    fn test_invalidate_removes_from_both_tiers() {
        let cache = small_cache();
        cache.put("model:1:record", bytes("v1")).unwrap();
        cache.invalidate("model:1:record");

        assert!(cache.get("model:1:record").is_none());
        let stats = cache.stats();
        assert_eq!(stats.memory_entries + stats.secondary_entries, 0);
    }

    #[test]
    fn test_invalidate_prefix_only_touches_matching_keys() {
        let cache = small_cache();
        cache.put("model:1:record", bytes("a")).unwrap();
        cache.put("model:1:meta", bytes("b")).unwrap();
        cache.put("model:2:record", bytes("c")).unwrap();

        cache.invalidate_prefix("model:1:");
        assert!(cache.get("model:1:record").is_none());
        assert!(cache.get("model:1:meta").is_none());
        assert!(cache.get("model:2:record").is_some());
    }

    #[test]
    fn test_stale_load_is_not_published() {
        let cache = small_cache();
        let ticket = cache.load_ticket();

        // A writer invalidates while the reader is loading
        cache.invalidate("model:1:record");

        assert!(!cache.put_if_fresh(ticket, "model:1:record", bytes("old")).unwrap());
        assert!(cache.get("model:1:record").is_none());

        let fresh = cache.load_ticket();
        assert!(cache.put_if_fresh(fresh, "model:1:record", bytes("new")).unwrap());
        assert_eq!(cache.get("model:1:record").as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn test_disk_secondary_tier() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(CacheConfig {
            memory_ceiling_bytes: 4,
            secondary_ceiling_bytes: 1024,
            secondary_dir: Some(dir.path().join("cache")),
        })
        .unwrap();

        cache.put("search:q", bytes("results")).unwrap();
        assert_eq!(cache.stats().memory_entries, 0);
        assert_eq!(cache.get("search:q").as_deref(), Some(&b"results"[..]));

        cache.invalidate_all();
        assert!(cache.get("search:q").is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let cache = small_cache();
        let other = cache.clone();
        other.put("k", bytes("v")).unwrap();
        assert!(cache.get("k").is_some());
    }
}
