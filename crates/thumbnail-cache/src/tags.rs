//! Tag-store interface consumed by color-space detection and the deep-EXR short-circuit
//!
//! The pipeline never owns a tag database. Callers hand a [`TagStore`] to the
//! pipeline and worker; `tag-db` provides the SQLite implementation and
//! [`MemoryTagStore`] serves tests and database-less tools.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Working color space tag for ACEScg (AP1) sources
pub const TAG_ACESCG: &str = "ACEScg";
/// Working color space tag for scene-linear Rec.709 sources
pub const TAG_LINEAR_SRGB: &str = "Linear sRGB";
/// View transform tag that also selects the ACES tone mapper
pub const TAG_VIEW_ACES: &str = "sRGB(ACES)";
/// View transform tag for the standard tone mapper
pub const TAG_VIEW_SRGB: &str = "sRGB";
/// Marker for deep EXR files that are never decoded
pub const TAG_DEEP_DATA: &str = "deepdata";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub category: Option<String>,
    pub color: Option<String>,
}

/// Per-file metadata as returned by the tag store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub tags: Vec<Tag>,
    pub rating: i32,
    pub color_label: Option<String>,
}

impl FileMetadata {
    /// Case-insensitive tag lookup
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name.eq_ignore_ascii_case(name))
    }
}

pub trait TagStore: Send + Sync {
    /// Metadata for a file; files never seen return the default (no tags)
    fn file_metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Create a tag if needed and return its id
    fn add_tag(&self, name: &str, category: Option<&str>, color: Option<&str>) -> Result<i64>;

    /// Attach an existing tag to a file
    fn add_tag_to_file(&self, path: &Path, tag_id: i64) -> Result<()>;
}

/// True if the file carries `name`. Store errors are logged and read as "no".
pub fn file_has_tag(store: &dyn TagStore, path: &Path, name: &str) -> bool {
    match store.file_metadata(path) {
        Ok(meta) => meta.has_tag(name),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "tag store lookup failed");
            false
        }
    }
}

/// Attach `name` to the file unless already present. Returns whether a tag was added.
pub fn ensure_file_tag(store: &dyn TagStore, path: &Path, name: &str) -> Result<bool> {
    if store.file_metadata(path)?.has_tag(name) {
        return Ok(false);
    }
    let tag_id = store.add_tag(name, None, None)?;
    store.add_tag_to_file(path, tag_id)?;
    Ok(true)
}

/// In-process tag store
#[derive(Default)]
pub struct MemoryTagStore {
    inner: Mutex<MemoryTagStoreInner>,
}

#[derive(Default)]
struct MemoryTagStoreInner {
    tags: Vec<Tag>,
    files: HashMap<PathBuf, Vec<i64>>,
}

impl MemoryTagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TagStore for MemoryTagStore {
    fn file_metadata(&self, path: &Path) -> Result<FileMetadata> {
        let inner = self.inner.lock();
        let tags = inner
            .files
            .get(path)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.tags.iter().find(|t| t.id == *id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(FileMetadata {
            tags,
            ..FileMetadata::default()
        })
    }

    fn add_tag(&self, name: &str, category: Option<&str>, color: Option<&str>) -> Result<i64> {
        let mut inner = self.inner.lock();
        if let Some(tag) = inner.tags.iter().find(|t| t.name == name) {
            return Ok(tag.id);
        }
        let id = inner.tags.len() as i64 + 1;
        inner.tags.push(Tag {
            id,
            name: name.to_string(),
            category: category.map(str::to_string),
            color: color.map(str::to_string),
        });
        Ok(id)
    }

    fn add_tag_to_file(&self, path: &Path, tag_id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.tags.iter().any(|t| t.id == tag_id) {
            bail!("Unknown tag id {}", tag_id);
        }
        let ids = inner.files.entry(path.to_path_buf()).or_default();
        if !ids.contains(&tag_id) {
            ids.push(tag_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_tag_is_idempotent() -> Result<()> {
        let store = MemoryTagStore::new();
        let path = Path::new("/renders/beauty.exr");

        assert!(ensure_file_tag(&store, path, TAG_ACESCG)?);
        assert!(!ensure_file_tag(&store, path, "acescg")?);

        let meta = store.file_metadata(path)?;
        assert_eq!(meta.tags.len(), 1);
        assert!(meta.has_tag("ACESCG"));
        assert!(file_has_tag(&store, path, TAG_ACESCG));
        assert!(!file_has_tag(&store, Path::new("/other.exr"), TAG_ACESCG));
        Ok(())
    }

    #[test]
    fn test_add_tag_reuses_id() -> Result<()> {
        let store = MemoryTagStore::new();
        let a = store.add_tag("hero", Some("shot"), None)?;
        let b = store.add_tag("hero", None, None)?;
        assert_eq!(a, b);
        assert!(store.add_tag_to_file(Path::new("/x.exr"), 99).is_err());
        Ok(())
    }
}
