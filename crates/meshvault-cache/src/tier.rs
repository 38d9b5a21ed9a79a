//! A single cache tier with strict LRU eviction
//!
//! Entries are ordered by a monotonically increasing access tick. Resident
//! bytes are tracked on every insert and removal, and an insert that would
//! exceed the ceiling evicts the oldest entries first.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::CacheError;

/// Where a tier keeps its values
pub(crate) enum Backend {
    Memory(HashMap<String, Arc<[u8]>>),
    Disk(PathBuf),
}

impl Backend {
    pub(crate) fn memory() -> Self {
        Backend::Memory(HashMap::new())
    }

    /// Disk backend rooted at `dir`. Files left from a previous session are
    /// removed since the index does not survive restarts.
    pub(crate) fn disk(dir: &Path) -> Result<Self, CacheError> {
        let to_err = |source| CacheError::Directory {
            path: dir.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(to_err)?;
        for entry in std::fs::read_dir(dir).map_err(to_err)? {
            let path = entry.map_err(to_err)?.path();
            if path.extension().is_some_and(|ext| ext == "bin") {
                let _ = std::fs::remove_file(path);
            }
        }
        Ok(Backend::Disk(dir.to_path_buf()))
    }

    fn read(&self, key: &str) -> Option<Arc<[u8]>> {
        match self {
            Backend::Memory(map) => map.get(key).cloned(),
            Backend::Disk(dir) => std::fs::read(entry_path(dir, key)).ok().map(Arc::from),
        }
    }

    fn write(&mut self, key: &str, value: &Arc<[u8]>) -> Result<(), CacheError> {
        match self {
            Backend::Memory(map) => {
                map.insert(key.to_string(), Arc::clone(value));
                Ok(())
            }
            Backend::Disk(dir) => {
                std::fs::write(entry_path(dir, key), value).map_err(|source| CacheError::Write {
                    key: key.to_string(),
                    source,
                })
            }
        }
    }

    fn remove(&mut self, key: &str) {
        match self {
            Backend::Memory(map) => {
                map.remove(key);
            }
            Backend::Disk(dir) => {
                let _ = std::fs::remove_file(entry_path(dir, key));
            }
        }
    }
}

fn entry_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{:x}.bin", Sha256::digest(key.as_bytes())))
}

struct EntryMeta {
    size: u64,
    tick: u64,
}

pub(crate) struct LruTier {
    backend: Backend,
    ceiling: u64,
    used: u64,
    entries: HashMap<String, EntryMeta>,
    /// access tick -> key, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
    evictions: u64,
}

impl LruTier {
    pub(crate) fn new(backend: Backend, ceiling: u64) -> Self {
        Self {
            backend,
            ceiling,
            used: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            evictions: 0,
        }
    }

    pub(crate) fn get(&mut self, key: &str) -> Option<Arc<[u8]>> {
        if !self.entries.contains_key(key) {
            return None;
        }

        match self.backend.read(key) {
            Some(value) => {
                self.touch(key);
                Some(value)
            }
            None => {
                // Backing file vanished underneath us
                self.remove(key);
                None
            }
        }
    }

    /// Insert or replace `key`, evicting least recently used entries as needed.
    ///
    /// Returns false if the value alone is larger than the ceiling; the tier
    /// then holds no entry for `key`.
    pub(crate) fn put(&mut self, key: &str, value: Arc<[u8]>) -> Result<bool, CacheError> {
        let size = value.len() as u64;
        self.remove(key);

        if size > self.ceiling {
            return Ok(false);
        }

        while self.used + size > self.ceiling {
            if !self.evict_oldest() {
                break;
            }
        }

        self.backend.write(key, &value)?;
        let tick = self.bump_tick();
        self.order.insert(tick, key.to_string());
        self.entries.insert(key.to_string(), EntryMeta { size, tick });
        self.used += size;
        Ok(true)
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(meta) => {
                self.order.remove(&meta.tick);
                self.used -= meta.size;
                self.backend.remove(key);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_prefix(&mut self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let keys: Vec<String> = self.entries.keys().cloned().collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    pub(crate) fn used_bytes(&self) -> u64 {
        self.used
    }

    pub(crate) fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Keys from least to most recently used
    #[cfg(test)]
    pub(crate) fn keys_by_recency(&self) -> Vec<String> {
        self.order.values().cloned().collect()
    }

    fn touch(&mut self, key: &str) {
        let tick = self.bump_tick();
        if let Some(meta) = self.entries.get_mut(key) {
            self.order.remove(&meta.tick);
            meta.tick = tick;
            self.order.insert(tick, key.to_string());
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(meta) = self.entries.remove(&key) {
            self.used -= meta.size;
        }
        self.backend.remove(&key);
        self.evictions += 1;
        tracing::trace!(key = %key, "Evicted cache entry");
        true
    }

    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }
}
