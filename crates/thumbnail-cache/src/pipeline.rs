//! Per-item processing: memory cache → disk cache → decode → tone map → store

use crate::bitmap::ThumbnailBitmap;
use crate::decode::{DecodeChain, DecodeError};
use crate::disk::DiskThumbnailCache;
use crate::memory::MemoryThumbnailCache;
use crate::tags::FileMetadata;
use crate::tonemap::ToneMapper;
use crate::{AssetRef, ThumbnailConfig};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reported before work on an item starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// Served from memory or disk
    Cache,
    /// Being decoded from source
    Generating,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStatus::Cache => write!(f, "cache"),
            CacheStatus::Generating => write!(f, "generating"),
        }
    }
}

/// Where a ready bitmap came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Memory,
    Disk,
    Generated,
}

/// Result of processing one request
#[derive(Debug, Clone)]
pub enum Outcome {
    Ready {
        bitmap: Arc<ThumbnailBitmap>,
        source: Source,
    },
    /// The extension has no thumbnail method; draw a placeholder
    NoThumbnail,
    /// Deep or otherwise unrepresentable data
    Unsupported(String),
    Encrypted,
    Failed(String),
}

/// Settings applied to every generated thumbnail
#[derive(Debug, Clone, Copy)]
pub struct RenderSettings {
    pub thumbnail_size: u32,
    pub jpeg_quality: u8,
    pub exposure: f32,
}

impl From<&ThumbnailConfig> for RenderSettings {
    fn from(config: &ThumbnailConfig) -> Self {
        Self {
            thumbnail_size: config.thumbnail_size,
            jpeg_quality: config.jpeg_quality,
            exposure: config.exposure,
        }
    }
}

pub struct ThumbnailPipeline {
    chain: DecodeChain,
    memory: Arc<MemoryThumbnailCache>,
    disk: Arc<DiskThumbnailCache>,
    settings: RenderSettings,
}

impl ThumbnailPipeline {
    pub fn new(
        chain: DecodeChain,
        memory: Arc<MemoryThumbnailCache>,
        disk: Arc<DiskThumbnailCache>,
        settings: RenderSettings,
    ) -> Self {
        Self {
            chain,
            memory,
            disk,
            settings,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryThumbnailCache> {
        &self.memory
    }

    pub fn disk(&self) -> &Arc<DiskThumbnailCache> {
        &self.disk
    }

    pub fn chain(&self) -> &DecodeChain {
        &self.chain
    }

    pub fn settings(&self) -> RenderSettings {
        self.settings
    }

    /// Memory-only lookup for callers that must not block on disk
    pub fn peek(&self, asset: &AssetRef) -> Option<Arc<ThumbnailBitmap>> {
        self.memory.get(&asset.memory_key())
    }

    /// Memory, then disk for plain files. A disk hit is promoted to memory.
    pub fn cached(&self, asset: &AssetRef) -> Option<(Arc<ThumbnailBitmap>, Source)> {
        let key = asset.memory_key();
        if let Some(bitmap) = self.memory.get(&key) {
            return Some((bitmap, Source::Memory));
        }
        if asset.is_sequence() {
            return None;
        }
        let bitmap = Arc::new(self.disk.get(&asset.path, asset.mtime)?);
        self.memory.set(key, bitmap.clone());
        Some((bitmap, Source::Disk))
    }

    /// Full processing of one request; `on_status` fires before any decode work
    pub fn process(&self, asset: &AssetRef, mut on_status: impl FnMut(CacheStatus)) -> Outcome {
        if let Some((bitmap, source)) = self.cached(asset) {
            on_status(CacheStatus::Cache);
            return Outcome::Ready { bitmap, source };
        }
        on_status(CacheStatus::Generating);
        self.generate(asset)
    }

    /// Decode and tone map from source, then populate both caches
    pub fn generate(&self, asset: &AssetRef) -> Outcome {
        let Some(source_path) = asset.source_path() else {
            return Outcome::Failed(format!("sequence {} has no frames", asset.path.display()));
        };

        let decoded = match self.chain.decode(source_path, self.settings.thumbnail_size) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Outcome::NoThumbnail,
            Err(DecodeError::Unsupported(reason)) => {
                debug!(path = %source_path.display(), %reason, "no thumbnail for unsupported image");
                return Outcome::Unsupported(reason);
            }
            Err(DecodeError::Encrypted) => return Outcome::Encrypted,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        let mapper = ToneMapper::for_metadata(&self.metadata(source_path), self.settings.exposure);
        let bitmap = Arc::new(mapper.apply(&decoded));
        debug!(
            path = %source_path.display(),
            transform = ?mapper.transform,
            size = ?(bitmap.width(), bitmap.height()),
            "generated thumbnail"
        );

        // Sequences are regenerated from the middle frame each session
        if !asset.is_sequence() {
            if let Err(e) = self
                .disk
                .set(&asset.path, asset.mtime, &bitmap, self.settings.jpeg_quality)
            {
                warn!(path = %asset.path.display(), error = %e, "failed to write disk cache");
            }
        }
        self.memory.set(asset.memory_key(), bitmap.clone());

        Outcome::Ready {
            bitmap,
            source: Source::Generated,
        }
    }

    fn metadata(&self, path: &Path) -> FileMetadata {
        self.chain.tag_store().file_metadata(path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "failed to read tags, using the standard view");
            FileMetadata::default()
        })
    }
}
