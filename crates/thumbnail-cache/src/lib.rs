//! Thumbnail decoding, color management and caching library for AssetLoupe
//!
//! This crate turns heterogeneous production imagery (EXR renders, Radiance HDRIs,
//! high-bit TIFF plates, PSD, PDF and ordinary 8-bit formats) into small display-ready
//! bitmaps, and makes sure the expensive decode and tone-map work happens at most once
//! per `(file, mtime)` pair.
//!
//! # Features
//!
//! - **Ordered decode fallback**: per-extension strategy lists, first success wins
//! - **Color management**: ACES RRT+ODT or Reinhard+gamma, chosen from persisted tags
//! - **Color space detection**: renderer metadata, channel count, filename and aspect heuristics
//! - **Two-tier caching**: bounded in-memory LRU plus a persistent content-addressed JPEG store
//! - **Background worker**: LIFO queue with request coalescing and progress events
//! - **Image sequences**: one thumbnail per sequence, taken from the middle frame

pub mod bitmap;
pub mod colorspace;
pub mod decode;
pub mod disk;
pub mod formats;
pub mod memory;
pub mod pipeline;
pub mod placeholder;
pub mod tags;
pub mod tonemap;
pub mod worker;

pub use bitmap::ThumbnailBitmap;
pub use colorspace::{ColorTag, ColorspaceDetector, Detection, DetectionRule, SourceInfo};
pub use decode::{DecodeChain, DecodeError, DecodedImage, ReducedScale};
pub use disk::{DiskCacheStats, DiskThumbnailCache};
pub use formats::{FormatTable, ThumbnailMethod};
pub use memory::MemoryThumbnailCache;
pub use pipeline::{Outcome, RenderSettings, ThumbnailPipeline};
pub use placeholder::placeholder;
pub use tags::{FileMetadata, MemoryTagStore, Tag, TagStore};
pub use tonemap::{ToneMapper, ViewTransform};
pub use worker::{CacheStatus, ThumbnailEvent, ThumbnailWorker, WorkerOptions};

use anyhow::{bail, Context, Result};
use md5::{Digest, Md5};
use sequence_detection::ImageSequence;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Runtime configuration, stored as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Longest edge of generated thumbnails, in pixels
    pub thumbnail_size: u32,
    pub jpeg_quality: u8,
    pub disk_cache_mb: f64,
    pub memory_cache_entries: usize,
    pub poll_interval_ms: u64,
    /// User exposure in stops, applied to float sources
    pub exposure: f32,
    /// `None` resolves to `~/.assetloupe/thumbnails`
    pub cache_dir: Option<PathBuf>,
    /// Pending request limit; 0 disables the bound
    pub max_queue_len: usize,
    pub formats: FormatTable,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            thumbnail_size: 128,
            jpeg_quality: 85,
            disk_cache_mb: disk::DEFAULT_DISK_BUDGET_MB,
            memory_cache_entries: 2000,
            poll_interval_ms: 50,
            exposure: 0.0,
            cache_dir: None,
            max_queue_len: 10_000,
            formats: FormatTable::default(),
        }
    }
}

impl ThumbnailConfig {
    /// Read a config file; keys that are absent take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.validate()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write config: {}", path.display()))
    }

    /// Clamp out-of-range values and reject unusable ones
    pub fn validate(mut self) -> Result<Self> {
        if self.thumbnail_size == 0 {
            bail!("thumbnail_size must be greater than zero");
        }
        if !self.disk_cache_mb.is_finite() || self.disk_cache_mb < 0.0 {
            bail!("disk_cache_mb must be a non-negative number");
        }
        if !self.exposure.is_finite() {
            bail!("exposure must be finite");
        }
        self.jpeg_quality = self.jpeg_quality.min(100);
        self.memory_cache_entries = self.memory_cache_entries.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        Ok(self)
    }

    pub fn resolved_cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let home_dir = dirs::home_dir().context("Unable to find home directory")?;
                Ok(home_dir.join(".assetloupe").join("thumbnails"))
            }
        }
    }
}

/// Render an mtime the way the cache has always spelled it: integral values keep a `.0`
pub fn format_mtime(mtime: f64) -> String {
    if mtime.is_finite() && mtime.fract() == 0.0 {
        format!("{mtime:.1}")
    } else {
        format!("{mtime}")
    }
}

/// Deterministic cache key: hex md5 of `"<path>_<mtime>"`
pub fn cache_key(path: &Path, mtime: f64) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{}_{}", path.display(), format_mtime(mtime)).as_bytes());
    hex::encode(hasher.finalize())
}

/// Modification time in seconds since the epoch
pub fn file_mtime(path: &Path) -> Result<f64> {
    let modified = fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .modified()?;
    Ok(modified.duration_since(std::time::UNIX_EPOCH)?.as_secs_f64())
}

/// A thumbnail request: a single file, or an image sequence identified by its pattern
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRef {
    /// File path, or the `name_####.ext` pattern path for sequences
    pub path: PathBuf,
    pub mtime: f64,
    pub sequence: Option<Arc<ImageSequence>>,
}

impl AssetRef {
    pub fn new(path: impl Into<PathBuf>, mtime: f64) -> Self {
        Self {
            path: path.into(),
            mtime,
            sequence: None,
        }
    }

    /// Reference a file on disk using its current mtime
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mtime = file_mtime(&path)?;
        Ok(Self::new(path, mtime))
    }

    pub fn from_sequence(sequence: ImageSequence) -> Self {
        Self {
            path: sequence.pattern_path(),
            mtime: sequence.latest_mtime(),
            sequence: Some(Arc::new(sequence)),
        }
    }

    pub fn is_sequence(&self) -> bool {
        self.sequence.is_some()
    }

    /// Memory cache key: the pattern for sequences, the content key otherwise
    pub fn memory_key(&self) -> String {
        if self.is_sequence() {
            self.path.to_string_lossy().into_owned()
        } else {
            cache_key(&self.path, self.mtime)
        }
    }

    /// The file actually decoded
    pub fn source_path(&self) -> Option<&Path> {
        match &self.sequence {
            Some(sequence) => sequence.middle_frame().map(|frame| frame.path.as_path()),
            None => Some(&self.path),
        }
    }
}
