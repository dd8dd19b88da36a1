//! Per-extension thumbnail method table

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// How thumbnails are produced for a file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailMethod {
    /// OpenEXR, float channels with deep-data detection
    Exr,
    /// Radiance RGBE
    Radiance,
    /// TIFF and friends, 8/16/32-bit
    HighBit,
    /// Photoshop documents
    Psd,
    /// PDF documents, first page
    Pdf,
    /// 8-bit formats (JPEG, PNG, ...)
    Standard,
    /// No thumbnail, the consumer draws a placeholder
    None,
}

impl fmt::Display for ThumbnailMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThumbnailMethod::Exr => "exr",
            ThumbnailMethod::Radiance => "radiance",
            ThumbnailMethod::HighBit => "high_bit",
            ThumbnailMethod::Psd => "psd",
            ThumbnailMethod::Pdf => "pdf",
            ThumbnailMethod::Standard => "standard",
            ThumbnailMethod::None => "none",
        };
        write!(f, "{}", name)
    }
}

const DEFAULT_METHODS: &[(&str, ThumbnailMethod)] = &[
    ("jpg", ThumbnailMethod::Standard),
    ("jpeg", ThumbnailMethod::Standard),
    ("png", ThumbnailMethod::Standard),
    ("bmp", ThumbnailMethod::Standard),
    ("gif", ThumbnailMethod::Standard),
    ("webp", ThumbnailMethod::Standard),
    ("tif", ThumbnailMethod::HighBit),
    ("tiff", ThumbnailMethod::HighBit),
    ("tx", ThumbnailMethod::HighBit),
    ("tga", ThumbnailMethod::HighBit),
    ("hdr", ThumbnailMethod::Radiance),
    ("exr", ThumbnailMethod::Exr),
    ("psd", ThumbnailMethod::Psd),
    ("pdf", ThumbnailMethod::Pdf),
    // Scene and asset formats
    ("ma", ThumbnailMethod::None),
    ("mb", ThumbnailMethod::None),
    ("obj", ThumbnailMethod::None),
    ("fbx", ThumbnailMethod::None),
    ("abc", ThumbnailMethod::None),
    ("usd", ThumbnailMethod::None),
    ("vdb", ThumbnailMethod::None),
    ("dae", ThumbnailMethod::None),
    ("stl", ThumbnailMethod::None),
    ("blend", ThumbnailMethod::None),
    ("hda", ThumbnailMethod::None),
    ("sbsar", ThumbnailMethod::None),
    // Scripts and text
    ("py", ThumbnailMethod::None),
    ("mel", ThumbnailMethod::None),
    ("txt", ThumbnailMethod::None),
];

/// Extension (lowercase, no dot) to thumbnail method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormatTable {
    methods: BTreeMap<String, ThumbnailMethod>,
}

impl Default for FormatTable {
    fn default() -> Self {
        Self {
            methods: DEFAULT_METHODS
                .iter()
                .map(|(ext, method)| (ext.to_string(), *method))
                .collect(),
        }
    }
}

impl FormatTable {
    /// Method for a path; unknown extensions get [`ThumbnailMethod::None`]
    pub fn method_for(&self, path: &Path) -> ThumbnailMethod {
        self.method_for_extension(&extension(path))
    }

    pub fn method_for_extension(&self, ext: &str) -> ThumbnailMethod {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        self.methods
            .get(&ext)
            .copied()
            .unwrap_or(ThumbnailMethod::None)
    }

    /// Override the method for one extension
    pub fn set(&mut self, ext: &str, method: ThumbnailMethod) {
        self.methods
            .insert(ext.trim_start_matches('.').to_ascii_lowercase(), method);
    }

    /// Extensions that produce a real thumbnail
    pub fn thumbnail_extensions(&self) -> impl Iterator<Item = &str> {
        self.methods
            .iter()
            .filter(|(_, m)| **m != ThumbnailMethod::None)
            .map(|(ext, _)| ext.as_str())
    }
}

/// Lowercase extension without the dot, empty when there is none
pub fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}
