//! Embedding and query-result caches.
//!
//! Both caches are append-only maps keyed by deterministic hashes: readers
//! share a read lock, writers take one short write section. They are created
//! by the orchestrator and live as long as it does; nothing here is global.
//! When a cache reaches its capacity new entries are simply not stored.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use fxhash::FxHashMap;
use parking_lot::RwLock;
use serde::Serialize;

pub type EmbeddingKey = [u8; 32];

/// Hit/miss counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Inserts dropped because the cache was full.
    pub rejected: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn reject(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self, entries: usize, capacity: usize) -> CacheStats {
        CacheStats {
            entries,
            capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Content-hash → vector cache shared by all embedding calls.
#[derive(Debug)]
pub struct EmbeddingCache {
    enabled: bool,
    capacity: usize,
    entries: RwLock<FxHashMap<EmbeddingKey, Arc<[f32]>>>,
    counters: Counters,
}

impl EmbeddingCache {
    pub fn new(enabled: bool, capacity: usize) -> Self {
        Self {
            enabled,
            capacity,
            entries: RwLock::new(FxHashMap::default()),
            counters: Counters::default(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &EmbeddingKey) -> Option<Arc<[f32]>> {
        if !self.enabled {
            return None;
        }
        let found = self.entries.read().get(key).cloned();
        match found {
            Some(_) => self.counters.hit(),
            None => self.counters.miss(),
        }
        found
    }

    pub fn insert(&self, key: EmbeddingKey, vector: &[f32]) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return;
        }
        if entries.len() >= self.capacity {
            self.counters.reject();
            return;
        }
        entries.insert(key, Arc::from(vector));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().clear();
        self.counters.reset();
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot(self.len(), self.capacity)
    }

    /// Write all entries as MessagePack, atomically replacing `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot: Vec<(EmbeddingKey, Vec<f32>)> = self
            .entries
            .read()
            .iter()
            .map(|(key, vector)| (*key, vector.to_vec()))
            .collect();
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create cache directory {parent:?}"))?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("create temp cache file in {parent:?}"))?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            rmp_serde::encode::write(&mut writer, &snapshot).context("encode embedding cache")?;
            writer.flush().context("flush embedding cache")?;
        }
        temp.as_file().sync_all().context("fsync embedding cache")?;
        temp.persist(path)
            .with_context(|| format!("persist embedding cache {path:?}"))?;
        Ok(())
    }

    /// Merge entries from a file written by [`Self::save`]. Returns how many
    /// entries were added. A missing file loads nothing.
    pub fn load(&self, path: &Path) -> Result<usize> {
        if !self.enabled || !path.exists() {
            return Ok(0);
        }
        let file = File::open(path).with_context(|| format!("open embedding cache {path:?}"))?;
        let snapshot: Vec<(EmbeddingKey, Vec<f32>)> =
            rmp_serde::decode::from_read(BufReader::new(file))
                .with_context(|| format!("decode embedding cache {path:?}"))?;
        let before = self.len();
        for (key, vector) in snapshot {
            self.insert(key, &vector);
        }
        Ok(self.len() - before)
    }
}

/// Query hash → response cache.
#[derive(Debug)]
pub struct QueryCache<V> {
    capacity: usize,
    entries: RwLock<FxHashMap<u64, V>>,
    counters: Counters,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(FxHashMap::default()),
            counters: Counters::default(),
        }
    }

    pub fn get(&self, key: u64) -> Option<V> {
        let found = self.entries.read().get(&key).cloned();
        match found {
            Some(_) => self.counters.hit(),
            None => self.counters.miss(),
        }
        found
    }

    pub fn insert(&self, key: u64, value: V) {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return;
        }
        if entries.len() >= self.capacity {
            self.counters.reject();
            return;
        }
        entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().clear();
        self.counters.reset();
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot(self.len(), self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn assert_send<T: Send>() {}

    fn assert_sync<T: Sync>() {}

    #[test]
    fn caches_are_send_sync() {
        assert_send::<EmbeddingCache>();
        assert_sync::<EmbeddingCache>();
        assert_send::<QueryCache<Vec<u32>>>();
        assert_sync::<QueryCache<Vec<u32>>>();
    }

    #[test]
    fn embedding_cache_counts_hits_and_misses() {
        let cache = EmbeddingCache::new(true, 10);
        let key = [7u8; 32];
        assert!(cache.get(&key).is_none());
        cache.insert(key, &[1.0, 2.0]);
        assert_eq!(cache.get(&key).as_deref(), Some(&[1.0, 2.0][..]));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = EmbeddingCache::disabled();
        cache.insert([1u8; 32], &[1.0]);
        assert!(cache.get(&[1u8; 32]).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn full_cache_rejects_new_entries_but_keeps_old() {
        let cache = QueryCache::new(1);
        cache.insert(1, "a".to_string());
        cache.insert(2, "b".to_string());
        assert_eq!(cache.get(1).as_deref(), Some("a"));
        assert!(cache.get(2).is_none());
        assert_eq!(cache.stats().rejected, 1);
    }

    #[test]
    fn existing_entries_are_never_overwritten() {
        let cache = QueryCache::new(4);
        cache.insert(1, 10u32);
        cache.insert(1, 20u32);
        assert_eq!(cache.get(1), Some(10));
    }

    #[test]
    fn clear_resets_entries_and_counters() {
        let cache = QueryCache::new(4);
        cache.insert(7, 1u8);
        let _ = cache.get(7);
        cache.clear();
        assert_eq!(cache.stats(), CacheStats { capacity: 4, ..CacheStats::default() });
    }

    #[test]
    fn embedding_cache_persists_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cache").join("embeddings.msgpack");
        let cache = EmbeddingCache::new(true, 10);
        cache.insert([1u8; 32], &[0.5, -0.5]);
        cache.insert([2u8; 32], &[1.0, 0.0]);
        cache.save(&path)?;

        let restored = EmbeddingCache::new(true, 10);
        assert_eq!(restored.load(&path)?, 2);
        assert_eq!(restored.get(&[1u8; 32]).as_deref(), Some(&[0.5, -0.5][..]));
        assert_eq!(restored.load(&dir.path().join("missing"))?, 0);
        Ok(())
    }
}
