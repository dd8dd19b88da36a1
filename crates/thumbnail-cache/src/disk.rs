//! Persistent content-addressed thumbnail store
//!
//! Layout:
//!
//! ```text
//! <cache_dir>/<md5(path + "_" + mtime)>.jpg
//! <cache_dir>/cache_info.json    {"hits": .., "misses": .., "generated": ..}
//! ```
//!
//! The total size of the `.jpg` files is kept under `max_size_mb`. When a write
//! pushes it over, files are deleted in ascending access-time order until the
//! total drops to 80% of the budget. Hits refresh the access time explicitly so
//! eviction order does not depend on `noatime` mounts.

use crate::bitmap::ThumbnailBitmap;
use crate::cache_key;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, FileTimes};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

pub const STATS_FILE: &str = "cache_info.json";
pub const DEFAULT_DISK_BUDGET_MB: f64 = 500.0;
/// Cleanup target as a fraction of the budget
pub const CLEANUP_TARGET: f64 = 0.8;

const STAGING_SUFFIX: &str = ".jpg.tmp";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Counters persisted in `cache_info.json`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounters {
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub misses: u64,
    #[serde(default)]
    pub generated: u64,
}

/// Snapshot reported by [`DiskThumbnailCache::stats`]
#[derive(Debug, Clone, Serialize)]
pub struct DiskCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub generated: u64,
    pub cache_size_mb: f64,
    pub cache_dir: PathBuf,
    pub file_count: usize,
}

impl DiskCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

struct CachedFile {
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
}

pub struct DiskThumbnailCache {
    cache_dir: PathBuf,
    max_size_mb: Mutex<f64>,
    /// Guards the counters and every write to the directory
    counters: Mutex<CacheCounters>,
}

impl DiskThumbnailCache {
    /// Open (creating if needed) a cache directory and load its counters
    pub fn new(cache_dir: impl Into<PathBuf>, max_size_mb: f64) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("Failed to create cache directory: {}", cache_dir.display()))?;

        let counters = load_counters(&cache_dir.join(STATS_FILE));
        debug!(dir = %cache_dir.display(), ?counters, "opened disk thumbnail cache");

        Ok(Self {
            cache_dir,
            max_size_mb: Mutex::new(max_size_mb.max(0.0)),
            counters: Mutex::new(counters),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn max_size_mb(&self) -> f64 {
        *self.max_size_mb.lock()
    }

    /// Change the budget; takes effect at the next write or [`cleanup`](Self::cleanup)
    pub fn set_max_size_mb(&self, max_size_mb: f64) {
        *self.max_size_mb.lock() = max_size_mb.max(0.0);
    }

    /// Path of the cached JPEG for `(path, mtime)`, whether or not it exists
    pub fn entry_path(&self, path: &Path, mtime: f64) -> PathBuf {
        self.cache_dir.join(format!("{}.jpg", cache_key(path, mtime)))
    }

    /// Fetch a cached thumbnail. Unreadable or corrupt entries count as misses.
    pub fn get(&self, path: &Path, mtime: f64) -> Option<ThumbnailBitmap> {
        let entry = self.entry_path(path, mtime);

        let bitmap = match fs::read(&entry) {
            Ok(bytes) => match ThumbnailBitmap::decode_jpeg(&bytes) {
                Ok(bitmap) => Some(bitmap),
                Err(e) => {
                    warn!(entry = %entry.display(), error = %e, "corrupt cached thumbnail, discarding");
                    if let Err(e) = fs::remove_file(&entry) {
                        warn!(entry = %entry.display(), error = %e, "failed to remove corrupt cached thumbnail");
                    }
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(entry = %entry.display(), error = %e, "failed to read cached thumbnail");
                None
            }
        };

        let mut counters = self.counters.lock();
        match bitmap {
            Some(bitmap) => {
                counters.hits += 1;
                if let Err(e) = touch(&entry) {
                    debug!(entry = %entry.display(), error = %e, "failed to refresh access time");
                }
                Some(bitmap)
            }
            None => {
                counters.misses += 1;
                None
            }
        }
    }

    /// Encode and store a thumbnail, then enforce the size budget
    pub fn set(&self, path: &Path, mtime: f64, bitmap: &ThumbnailBitmap, quality: u8) -> Result<PathBuf> {
        let entry = self.entry_path(path, mtime);
        let jpeg = bitmap.encode_jpeg(quality.clamp(1, 100))?;

        let mut counters = self.counters.lock();

        let staging = entry.with_extension(&STAGING_SUFFIX[1..]);
        fs::write(&staging, &jpeg)
            .with_context(|| format!("Failed to write cache file: {}", staging.display()))?;
        fs::rename(&staging, &entry)
            .with_context(|| format!("Failed to move cache file into place: {}", entry.display()))?;

        counters.generated += 1;
        if let Err(e) = self.save_counters(&counters) {
            warn!(error = %e, "failed to persist cache counters");
        }

        let budget = self.budget_bytes();
        let total = self.total_size_bytes()?;
        if total as f64 > budget {
            self.cleanup_locked(total)?;
        }

        Ok(entry)
    }

    /// Delete least recently accessed entries until the total is under 80% of the budget.
    ///
    /// Returns the number of files removed.
    pub fn cleanup(&self) -> Result<usize> {
        let _guard = self.counters.lock();
        self.sweep_staging();
        let total = self.total_size_bytes()?;
        if total as f64 <= self.budget_bytes() {
            return Ok(0);
        }
        self.cleanup_locked(total)
    }

    fn cleanup_locked(&self, mut total: u64) -> Result<usize> {
        let target = self.budget_bytes() * CLEANUP_TARGET;
        let mut files = self.cached_files()?;
        files.sort_by_key(|f| f.accessed);

        let mut removed = 0;
        for file in files {
            if total as f64 <= target {
                break;
            }
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    total = total.saturating_sub(file.size);
                    removed += 1;
                }
                Err(e) => warn!(entry = %file.path.display(), error = %e, "failed to evict cached thumbnail"),
            }
        }

        info!(removed, remaining_mb = total as f64 / BYTES_PER_MB, "disk thumbnail cache cleaned up");
        Ok(removed)
    }

    /// Remove every cached thumbnail and reset the counters
    pub fn clear(&self) -> Result<usize> {
        let mut counters = self.counters.lock();
        self.sweep_staging();
        let mut removed = 0;
        for file in self.cached_files()? {
            fs::remove_file(&file.path)
                .with_context(|| format!("Failed to remove cache file: {}", file.path.display()))?;
            removed += 1;
        }
        *counters = CacheCounters::default();
        self.save_counters(&counters)?;
        Ok(removed)
    }

    pub fn counters(&self) -> CacheCounters {
        *self.counters.lock()
    }

    pub fn stats(&self) -> Result<DiskCacheStats> {
        let counters = self.counters();
        let files = self.cached_files()?;
        let bytes: u64 = files.iter().map(|f| f.size).sum();
        Ok(DiskCacheStats {
            hits: counters.hits,
            misses: counters.misses,
            generated: counters.generated,
            cache_size_mb: bytes as f64 / BYTES_PER_MB,
            cache_dir: self.cache_dir.clone(),
            file_count: files.len(),
        })
    }

    /// Persist the counters now; hits and misses are otherwise only saved by writes
    pub fn flush(&self) -> Result<()> {
        let counters = self.counters.lock();
        self.save_counters(&counters)
    }

    pub fn total_size_bytes(&self) -> Result<u64> {
        Ok(self.cached_files()?.iter().map(|f| f.size).sum())
    }

    fn budget_bytes(&self) -> f64 {
        self.max_size_mb() * BYTES_PER_MB
    }

    fn cached_files(&self) -> Result<Vec<CachedFile>> {
        let mut files = Vec::new();
        let entries = fs::read_dir(&self.cache_dir)
            .with_context(|| format!("Failed to list cache directory: {}", self.cache_dir.display()))?;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "jpg") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let accessed = meta
                .accessed()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(CachedFile {
                path,
                size: meta.len(),
                accessed,
            });
        }
        Ok(files)
    }

    /// Remove `.jpg.tmp` files left by interrupted writes. Caller holds the write lock.
    fn sweep_staging(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return 0;
        };
        let mut swept = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.to_string_lossy().ends_with(STAGING_SUFFIX) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => swept += 1,
                Err(e) => warn!(entry = %path.display(), error = %e, "failed to remove stale staging file"),
            }
        }
        if swept > 0 {
            debug!(swept, "removed stale staging files");
        }
        swept
    }

    fn save_counters(&self, counters: &CacheCounters) -> Result<()> {
        let path = self.cache_dir.join(STATS_FILE);
        let json = serde_json::to_string_pretty(counters)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))
    }
}

impl Drop for DiskThumbnailCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            debug!(error = %e, "failed to persist cache counters on drop");
        }
    }
}

fn load_counters(path: &Path) -> CacheCounters {
    match fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "ignoring unreadable cache stats");
            CacheCounters::default()
        }),
        Err(_) => CacheCounters::default(),
    }
}

fn touch(path: &Path) -> std::io::Result<()> {
    let file = File::options().write(true).open(path)?;
    file.set_times(FileTimes::new().set_accessed(SystemTime::now()))
}
