//! Working color space classification for HDR sources
//!
//! Rules run in a fixed order and the first match wins:
//!
//! 1. Renderer metadata (Arnold, V-Ray, Redshift, Blender/Cycles header attributes)
//! 2. Five or more channels: render-layer output, assumed ACEScg
//! 3. File stem containing "aces"
//! 4. Exact 2:1 lat-long panorama: Linear sRGB
//! 5. Default: ACEScg
//!
//! `.hdr` and `.tx` files bypass the chain with fixed rules.

use crate::formats::extension;
use crate::tags::{ensure_file_tag, TagStore, TAG_ACESCG, TAG_LINEAR_SRGB, TAG_VIEW_ACES, TAG_VIEW_SRGB};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorTag {
    AcesCg,
    LinearSrgb,
    Unknown,
}

impl ColorTag {
    /// Tag name persisted in the tag store
    pub fn tag_name(self) -> Option<&'static str> {
        match self {
            ColorTag::AcesCg => Some(TAG_ACESCG),
            ColorTag::LinearSrgb => Some(TAG_LINEAR_SRGB),
            ColorTag::Unknown => None,
        }
    }

    /// Default view transform for this working space
    pub fn view_transform(self) -> &'static str {
        match self {
            ColorTag::AcesCg => TAG_VIEW_ACES,
            _ => TAG_VIEW_SRGB,
        }
    }
}

impl fmt::Display for ColorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name().unwrap_or("Unknown"))
    }
}

/// Which rule produced a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionRule {
    RendererMetadata(Renderer),
    ChannelCount,
    Filename,
    AspectRatio,
    Default,
    FormatFixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renderer {
    Arnold,
    VRay,
    Redshift,
    Blender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub color: ColorTag,
    pub rule: DetectionRule,
}

/// What the decoder learned about a file, all optional
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceInfo<'a> {
    pub channels: Option<usize>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub metadata: Option<&'a HashMap<String, String>>,
}

struct RendererRules {
    renderer: Renderer,
    keys: &'static [&'static str],
    /// Only the first key present is consulted
    first_key_only: bool,
    tokens: &'static [(&'static str, ColorTag)],
}

// First matching token wins within a renderer.
const RENDERERS: &[RendererRules] = &[
    RendererRules {
        renderer: Renderer::Arnold,
        keys: &["arnold/color_space"],
        first_key_only: false,
        tokens: &[
            ("acescg", ColorTag::AcesCg),
            ("aces2065-1", ColorTag::AcesCg),
            ("aces_cg", ColorTag::AcesCg),
            ("lin_ap1", ColorTag::AcesCg),
            ("srgb", ColorTag::LinearSrgb),
            ("rec.709", ColorTag::LinearSrgb),
            ("linear", ColorTag::LinearSrgb),
            ("scene_linear", ColorTag::LinearSrgb),
        ],
    },
    RendererRules {
        renderer: Renderer::VRay,
        keys: &["vray/colorspace", "vray/color_space", "VRayColorSpace"],
        first_key_only: false,
        tokens: &[
            ("aces", ColorTag::AcesCg),
            ("ap1", ColorTag::AcesCg),
            ("srgb", ColorTag::LinearSrgb),
            ("709", ColorTag::LinearSrgb),
            ("linear", ColorTag::LinearSrgb),
        ],
    },
    RendererRules {
        renderer: Renderer::Redshift,
        keys: &[
            "redshift/colorSpace",
            "redshift/color_space",
            "redshiftOptions/colorSpace",
        ],
        first_key_only: false,
        tokens: &[
            ("aces", ColorTag::AcesCg),
            ("ap1", ColorTag::AcesCg),
            ("srgb", ColorTag::LinearSrgb),
            ("709", ColorTag::LinearSrgb),
        ],
    },
    RendererRules {
        renderer: Renderer::Blender,
        keys: &["blender/colorspace", "cycles/colorspace"],
        first_key_only: true,
        tokens: &[
            ("aces", ColorTag::AcesCg),
            ("linear", ColorTag::LinearSrgb),
            ("srgb", ColorTag::LinearSrgb),
        ],
    },
];

/// Stateless classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorspaceDetector;

impl ColorspaceDetector {
    pub fn new() -> Self {
        Self
    }

    /// Run the general rule chain. Always returns ACEScg or Linear sRGB.
    pub fn detect(&self, path: &Path, info: SourceInfo<'_>) -> Detection {
        if let Some(found) = info.metadata.and_then(from_renderer_metadata) {
            return found;
        }

        if info.channels.is_some_and(|c| c >= 5) {
            return Detection {
                color: ColorTag::AcesCg,
                rule: DetectionRule::ChannelCount,
            };
        }

        let stem = stem_lowercase(path);
        if stem.contains("aces") {
            return Detection {
                color: ColorTag::AcesCg,
                rule: DetectionRule::Filename,
            };
        }

        if let (Some(w), Some(h)) = (info.width, info.height) {
            if h > 0 {
                let aspect = w as f64 / h as f64;
                if (aspect - 2.0).abs() < 0.01 && w == 2 * h {
                    return Detection {
                        color: ColorTag::LinearSrgb,
                        rule: DetectionRule::AspectRatio,
                    };
                }
            }
        }

        Detection {
            color: ColorTag::AcesCg,
            rule: DetectionRule::Default,
        }
    }

    /// Format-fixed rules, falling through to [`detect`](Self::detect)
    pub fn classify(&self, path: &Path, info: SourceInfo<'_>) -> Detection {
        match extension(path).as_str() {
            "hdr" => Detection {
                color: ColorTag::LinearSrgb,
                rule: DetectionRule::FormatFixed,
            },
            "tx" => {
                // covers "acescg", "-acescg" and "_acescg"
                let color = if stem_lowercase(path).contains("acescg") {
                    ColorTag::AcesCg
                } else {
                    ColorTag::LinearSrgb
                };
                Detection {
                    color,
                    rule: DetectionRule::FormatFixed,
                }
            }
            _ => self.detect(path, info),
        }
    }

    /// Classify and persist the working-space tag unless one is already present.
    ///
    /// Only `.exr`, `.hdr` and `.tx` are tagged; other files return `None`.
    pub fn auto_tag(
        &self,
        store: &dyn TagStore,
        path: &Path,
        info: SourceInfo<'_>,
    ) -> Result<Option<Detection>> {
        if !matches!(extension(path).as_str(), "exr" | "hdr" | "tx") {
            return Ok(None);
        }

        let meta = store.file_metadata(path)?;
        if meta.has_tag(TAG_ACESCG) || meta.has_tag(TAG_LINEAR_SRGB) {
            return Ok(None);
        }

        let detection = self.classify(path, info);
        if let Some(name) = detection.color.tag_name() {
            if ensure_file_tag(store, path, name)? {
                debug!(path = %path.display(), tag = name, rule = ?detection.rule, "auto-tagged color space");
            }
        }
        Ok(Some(detection))
    }
}

fn from_renderer_metadata(metadata: &HashMap<String, String>) -> Option<Detection> {
    for rules in RENDERERS {
        for key in rules.keys {
            let Some(value) = metadata.get(*key) else {
                continue;
            };
            let value = value.to_ascii_lowercase();
            if let Some((_, color)) = rules.tokens.iter().find(|(token, _)| value.contains(token)) {
                return Some(Detection {
                    color: *color,
                    rule: DetectionRule::RendererMetadata(rules.renderer),
                });
            }
            if rules.first_key_only {
                break;
            }
        }
    }
    None
}

fn stem_lowercase(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::MemoryTagStore;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_renderer_metadata_wins_over_filename() {
        let metadata = meta(&[("arnold/color_space", "lin_ap1")]);
        let d = ColorspaceDetector.detect(
            Path::new("/shots/sh010_aces_beauty.exr"),
            SourceInfo {
                channels: Some(3),
                metadata: Some(&metadata),
                ..SourceInfo::default()
            },
        );
        assert_eq!(d.color, ColorTag::AcesCg);
        assert_eq!(d.rule, DetectionRule::RendererMetadata(Renderer::Arnold));
    }

    #[test]
    fn test_renderer_tokens() {
        let cases = [
            (("vray/colorspace", "sRGB linear"), ColorTag::LinearSrgb),
            (("VRayColorSpace", "ACEScg"), ColorTag::AcesCg),
            (("redshift/colorSpace", "Rec.709"), ColorTag::LinearSrgb),
            (("cycles/colorspace", "Linear Rec.709"), ColorTag::LinearSrgb),
            (("arnold/color_space", "scene_linear"), ColorTag::LinearSrgb),
        ];
        for ((key, value), expected) in cases {
            let metadata = meta(&[(key, value)]);
            let d = ColorspaceDetector.detect(
                Path::new("/r/plain.exr"),
                SourceInfo {
                    metadata: Some(&metadata),
                    ..SourceInfo::default()
                },
            );
            assert_eq!(d.color, expected, "{key}={value}");
        }
    }

    #[test]
    fn test_blender_reads_only_the_first_present_key() {
        let metadata = meta(&[
            ("blender/colorspace", "Filmic"),
            ("cycles/colorspace", "ACEScg"),
        ]);
        let d = ColorspaceDetector.detect(
            Path::new("/r/plain.exr"),
            SourceInfo {
                channels: Some(3),
                width: Some(2048),
                height: Some(1024),
                metadata: Some(&metadata),
            },
        );
        assert_eq!(d.rule, DetectionRule::AspectRatio);
        assert_eq!(d.color, ColorTag::LinearSrgb);

        // V-Ray keeps looking through its other keys
        let metadata = meta(&[("vray/colorspace", "custom"), ("VRayColorSpace", "ACEScg")]);
        let d = ColorspaceDetector.detect(
            Path::new("/r/plain.exr"),
            SourceInfo {
                metadata: Some(&metadata),
                ..SourceInfo::default()
            },
        );
        assert_eq!(d.rule, DetectionRule::RendererMetadata(Renderer::VRay));
    }

    #[test]
    fn test_unmatched_metadata_falls_through() {
        let metadata = meta(&[("arnold/color_space", "custom_display")]);
        let d = ColorspaceDetector.detect(
            Path::new("/r/pano.exr"),
            SourceInfo {
                channels: Some(3),
                width: Some(2048),
                height: Some(1024),
                metadata: Some(&metadata),
            },
        );
        assert_eq!(d.rule, DetectionRule::AspectRatio);
    }

    #[test]
    fn test_channel_count_rule() {
        let d = ColorspaceDetector.detect(
            Path::new("/r/beauty.exr"),
            SourceInfo {
                channels: Some(6),
                ..SourceInfo::default()
            },
        );
        assert_eq!(d.color, ColorTag::AcesCg);
        assert_eq!(d.rule, DetectionRule::ChannelCount);
    }

    #[test]
    fn test_aspect_ratio_rule_yields_to_channel_count() {
        let path = Path::new("/hdri/env_2048x1024.hdr");
        let pano = SourceInfo {
            channels: Some(3),
            width: Some(2048),
            height: Some(1024),
            metadata: None,
        };
        let d = ColorspaceDetector.detect(path, pano);
        assert_eq!(d.color, ColorTag::LinearSrgb);
        assert_eq!(d.rule, DetectionRule::AspectRatio);

        let d = ColorspaceDetector.detect(
            path,
            SourceInfo {
                channels: Some(5),
                ..pano
            },
        );
        assert_eq!(d.color, ColorTag::AcesCg);
        assert_eq!(d.rule, DetectionRule::ChannelCount);
    }

    #[test]
    fn test_near_two_to_one_is_not_latlong() {
        let d = ColorspaceDetector.detect(
            Path::new("/r/plate.exr"),
            SourceInfo {
                channels: Some(3),
                width: Some(2049),
                height: Some(1024),
                metadata: None,
            },
        );
        assert_eq!(d.rule, DetectionRule::Default);
        assert_eq!(d.color, ColorTag::AcesCg);
    }

    #[test]
    fn test_format_fixed_rules() {
        let d = ColorspaceDetector.classify(Path::new("/r/aces_sky.hdr"), SourceInfo::default());
        assert_eq!(d.color, ColorTag::LinearSrgb);
        assert_eq!(d.rule, DetectionRule::FormatFixed);

        let d = ColorspaceDetector.classify(Path::new("/tex/wood_ACEScg.tx"), SourceInfo::default());
        assert_eq!(d.color, ColorTag::AcesCg);
        let d = ColorspaceDetector.classify(Path::new("/tex/wood.tx"), SourceInfo::default());
        assert_eq!(d.color, ColorTag::LinearSrgb);
    }

    #[test]
    fn test_auto_tag_respects_existing_tag() -> Result<()> {
        let store = MemoryTagStore::new();
        let path = Path::new("/hdri/sky.hdr");

        let d = ColorspaceDetector.auto_tag(&store, path, SourceInfo::default())?;
        assert_eq!(d.map(|d| d.color), Some(ColorTag::LinearSrgb));
        assert!(store.file_metadata(path)?.has_tag(TAG_LINEAR_SRGB));

        // Second call finds the tag and leaves the store alone
        assert!(ColorspaceDetector.auto_tag(&store, path, SourceInfo::default())?.is_none());
        assert_eq!(store.file_metadata(path)?.tags.len(), 1);

        // Non-HDR formats are never tagged
        assert!(ColorspaceDetector
            .auto_tag(&store, Path::new("/a/photo.jpg"), SourceInfo::default())?
            .is_none());
        Ok(())
    }

    #[test]
    fn test_view_transform_names() {
        assert_eq!(ColorTag::AcesCg.view_transform(), "sRGB(ACES)");
        assert_eq!(ColorTag::LinearSrgb.view_transform(), "sRGB");
        assert_eq!(ColorTag::AcesCg.to_string(), "ACEScg");
    }
}
