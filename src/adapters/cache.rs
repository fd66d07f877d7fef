//! Table Cache
//!
//! TTL memoization layer over any `TableSource`. Entries are keyed by
//! `(path, as_of)`: a new snapshot time is a new table, so a stale read can
//! only come from a file rewritten in place within the TTL.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::domain::UnitTable;
use crate::ports::{LoadError, TableSource};

type CacheKey = (PathBuf, DateTime<Utc>);

/// Cache entry with TTL tracking
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub table: Arc<UnitTable>,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(table: Arc<UnitTable>, ttl: Duration) -> Self {
        Self {
            table,
            inserted_at: Instant::now(),
            ttl,
        }
    }

    /// Check if entry is still valid
    pub fn is_valid(&self) -> bool {
        self.inserted_at.elapsed() < self.ttl
    }

    /// Get time remaining before expiry
    pub fn time_remaining(&self) -> Option<Duration> {
        let elapsed = self.inserted_at.elapsed();
        if elapsed < self.ttl {
            Some(self.ttl - elapsed)
        } else {
            None
        }
    }
}

/// Bounded TTL store of loaded tables
#[derive(Debug)]
pub struct TableCache {
    entries: HashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    /// Maximum entries before cleanup
    max_entries: usize,
    hits: u64,
    misses: u64,
}

impl TableCache {
    /// Default TTL (15 minutes)
    pub const DEFAULT_TTL: Duration = Duration::from_secs(900);
    /// Default max cache entries
    pub const DEFAULT_MAX_ENTRIES: usize = 16;

    pub fn new() -> Self {
        Self::with_config(Self::DEFAULT_TTL, Self::DEFAULT_MAX_ENTRIES)
    }

    pub fn with_config(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
            hits: 0,
            misses: 0,
        }
    }

    pub fn insert(&mut self, path: &Path, as_of: DateTime<Utc>, table: Arc<UnitTable>) {
        if self.entries.len() >= self.max_entries {
            self.cleanup();
        }

        // Still at capacity after cleanup? Remove oldest entry
        if self.entries.len() >= self.max_entries {
            self.remove_oldest();
        }

        self.entries
            .insert((path.to_path_buf(), as_of), CacheEntry::new(table, self.ttl));
    }

    /// Valid table for the key, counting the lookup as a hit or a miss
    pub fn get(&mut self, path: &Path, as_of: DateTime<Utc>) -> Option<Arc<UnitTable>> {
        let found = self
            .entries
            .get(&(path.to_path_buf(), as_of))
            .filter(|entry| entry.is_valid())
            .map(|entry| Arc::clone(&entry.table));
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    pub fn contains(&self, path: &Path, as_of: DateTime<Utc>) -> bool {
        self.entries
            .get(&(path.to_path_buf(), as_of))
            .is_some_and(|entry| entry.is_valid())
    }

    pub fn remove(&mut self, path: &Path, as_of: DateTime<Utc>) -> Option<Arc<UnitTable>> {
        self.entries
            .remove(&(path.to_path_buf(), as_of))
            .map(|e| e.table)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove expired entries
    pub fn cleanup(&mut self) {
        self.entries.retain(|_, entry| entry.is_valid());
    }

    fn remove_oldest(&mut self) {
        if let Some(oldest_key) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(key, _)| key.clone())
        {
            self.entries.remove(&oldest_key);
        }
    }

    /// Number of entries (including expired)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_valid()).count()
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.entries.len();
        let valid = self.valid_count();
        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
            hits: self.hits,
            misses: self.misses,
        }
    }
}

impl Default for TableCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// `TableSource` that memoizes another source
#[derive(Debug)]
pub struct CachedTableSource<S> {
    inner: S,
    cache: Mutex<TableCache>,
}

impl<S: TableSource> CachedTableSource<S> {
    pub fn new(inner: S) -> Self {
        Self::with_cache(inner, TableCache::new())
    }

    pub fn with_cache(inner: S, cache: TableCache) -> Self {
        Self {
            inner,
            cache: Mutex::new(cache),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats()
    }

    /// Drop every cached table
    pub fn invalidate(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, TableCache> {
        // Entries are immutable Arcs; a panic mid-insert cannot corrupt them
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S: TableSource> TableSource for CachedTableSource<S> {
    fn load(&self, path: &Path, as_of: DateTime<Utc>) -> Result<Arc<UnitTable>, LoadError> {
        if let Some(table) = self.lock().get(path, as_of) {
            tracing::debug!("Table cache hit: {} @ {}", path.display(), as_of);
            return Ok(table);
        }

        // Load outside the lock; concurrent misses may both read the file
        let table = self.inner.load(path, as_of)?;
        self.lock().insert(path, as_of, Arc::clone(&table));
        tracing::debug!("Table cache miss: {} @ {}", path.display(), as_of);
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FeatureMatrix;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source that counts how often it is asked to load
    #[derive(Default)]
    struct CountingSource {
        loads: AtomicUsize,
    }

    impl CountingSource {
        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    impl TableSource for CountingSource {
        fn load(&self, path: &Path, _as_of: DateTime<Utc>) -> Result<Arc<UnitTable>, LoadError> {
            if path.ends_with("missing.csv") {
                return Err(LoadError::MissingColumn("treatment".to_string()));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(create_table()))
        }
    }

    fn create_table() -> UnitTable {
        UnitTable::new(
            None,
            vec![1, 0],
            vec![0, 1],
            vec!["age".to_string()],
            FeatureMatrix::from_rows(&[vec![30.0], vec![40.0]]).unwrap(),
        )
        .unwrap()
    }

    fn snapshot(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_cache_insert_and_get() {
        let mut cache = TableCache::new();
        let path = Path::new("data/experiment.csv");
        cache.insert(path, snapshot(9), Arc::new(create_table()));

        assert_eq!(cache.get(path, snapshot(9)).map(|t| t.len()), Some(2));
        assert!(cache.get(path, snapshot(10)).is_none());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_cache_expiry() {
        let mut cache = TableCache::with_config(Duration::from_millis(10), 10);
        let path = Path::new("data/experiment.csv");
        cache.insert(path, snapshot(9), Arc::new(create_table()));

        assert!(cache.contains(path, snapshot(9)));

        std::thread::sleep(Duration::from_millis(20));

        assert!(!cache.contains(path, snapshot(9)));
        assert_eq!(cache.stats().expired_entries, 1);

        cache.cleanup();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_max_entries() {
        let mut cache = TableCache::with_config(Duration::from_secs(60), 3);
        for hour in 0..5 {
            cache.insert(Path::new("a.csv"), snapshot(hour), Arc::new(create_table()));
        }
        assert!(cache.len() <= 3);
        // Most recent snapshot survives eviction
        assert!(cache.contains(Path::new("a.csv"), snapshot(4)));
    }

    #[test]
    fn test_cache_remove() {
        let mut cache = TableCache::new();
        let path = Path::new("a.csv");
        cache.insert(path, snapshot(1), Arc::new(create_table()));
        assert!(cache.remove(path, snapshot(1)).is_some());
        assert!(!cache.contains(path, snapshot(1)));
    }

    #[test]
    fn test_cache_entry_time_remaining() {
        let ttl = Duration::from_millis(100);
        let entry = CacheEntry::new(Arc::new(create_table()), ttl);

        let remaining = entry.time_remaining();
        assert!(remaining.is_some());
        assert!(remaining.unwrap() <= ttl);

        std::thread::sleep(Duration::from_millis(110));

        assert!(entry.time_remaining().is_none());
    }

    #[test]
    fn test_cached_source_loads_once_per_snapshot() {
        let source = CachedTableSource::new(CountingSource::default());
        let path = Path::new("data/experiment.csv");

        let first = source.load(path, snapshot(9)).unwrap();
        let second = source.load(path, snapshot(9)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.inner().loads(), 1);

        source.load(path, snapshot(10)).unwrap();
        assert_eq!(source.inner().loads(), 2);
        assert_eq!(source.stats().hits, 1);
    }

    #[test]
    fn test_cached_source_reloads_after_ttl() {
        let source = CachedTableSource::with_cache(
            CountingSource::default(),
            TableCache::with_config(Duration::from_millis(10), 4),
        );
        let path = Path::new("data/experiment.csv");
        source.load(path, snapshot(9)).unwrap();

        std::thread::sleep(Duration::from_millis(20));

        source.load(path, snapshot(9)).unwrap();
        assert_eq!(source.inner().loads(), 2);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let source = CachedTableSource::new(CountingSource::default());
        assert!(source.load(Path::new("missing.csv"), snapshot(9)).is_err());
        assert_eq!(source.stats().total_entries, 0);
    }

    #[test]
    fn test_invalidate() {
        let source = CachedTableSource::new(CountingSource::default());
        let path = Path::new("data/experiment.csv");
        source.load(path, snapshot(9)).unwrap();
        source.invalidate();
        source.load(path, snapshot(9)).unwrap();
        assert_eq!(source.inner().loads(), 2);
    }
}
