//! In-process thumbnail cache with bulk LRU eviction
//!
//! Entries are counted, not weighed. When an insert of a new key finds the cache
//! full, the least recently used quarter is dropped in one pass instead of one
//! entry per insert.

use crate::bitmap::ThumbnailBitmap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Default entry budget
pub const DEFAULT_MEMORY_ENTRIES: usize = 1000;

/// Thread-safe key → bitmap cache bounded by entry count
pub struct MemoryThumbnailCache {
    inner: Mutex<MemoryCacheInner>,
}

struct MemoryCacheInner {
    data: HashMap<String, (Arc<ThumbnailBitmap>, u64)>, // bitmap, last access
    max_size: usize,
    access_counter: u64,
    evictions: u64,
}

impl MemoryThumbnailCache {
    /// A `max_size` of zero is raised to one
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryCacheInner {
                data: HashMap::new(),
                max_size: max_size.max(1),
                access_counter: 0,
                evictions: 0,
            }),
        }
    }

    /// Look up a bitmap, marking it most recently used
    pub fn get(&self, key: &str) -> Option<Arc<ThumbnailBitmap>> {
        self.inner.lock().get(key)
    }

    /// Insert or replace a bitmap
    pub fn set(&self, key: impl Into<String>, bitmap: Arc<ThumbnailBitmap>) {
        self.inner.lock().insert(key.into(), bitmap);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().data.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Arc<ThumbnailBitmap>> {
        self.inner.lock().data.remove(key).map(|(bitmap, _)| bitmap)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.data.clear();
        inner.access_counter = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.inner.lock().max_size
    }

    /// Entries dropped by eviction since construction
    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }
}

impl MemoryCacheInner {
    fn get(&mut self, key: &str) -> Option<Arc<ThumbnailBitmap>> {
        self.access_counter += 1;
        let stamp = self.access_counter;
        self.data.get_mut(key).map(|entry| {
            entry.1 = stamp;
            entry.0.clone()
        })
    }

    fn insert(&mut self, key: String, bitmap: Arc<ThumbnailBitmap>) {
        self.access_counter += 1;

        // Replacing an entry never grows the cache
        if !self.data.contains_key(&key) && self.data.len() >= self.max_size {
            self.evict_oldest();
        }

        self.data.insert(key, (bitmap, self.access_counter));
    }

    /// Drop the least recently used 25%, at least one entry
    fn evict_oldest(&mut self) {
        let count = (self.data.len() / 4).max(1);

        let mut by_age: Vec<(u64, String)> = self
            .data
            .iter()
            .map(|(key, (_, stamp))| (*stamp, key.clone()))
            .collect();
        by_age.sort_unstable_by_key(|(stamp, _)| *stamp);

        for (_, key) in by_age.into_iter().take(count) {
            self.data.remove(&key);
        }
        self.evictions += count as u64;
    }
}

impl Default for MemoryThumbnailCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_ENTRIES)
    }
}

impl fmt::Debug for MemoryThumbnailCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryThumbnailCache")
            .field("len", &inner.data.len())
            .field("max_size", &inner.max_size)
            .field("evictions", &inner.evictions)
            .finish()
    }
}
