//! OpenEXR decoding
//!
//! The reader sits behind [`ExrBackend`] so the chain can be exercised without
//! real files. [`NativeExr`] implements it on top of the `exr` crate.

use super::resample::{fit_within_f32, reduce_plane};
use super::{DecodeChain, DecodeError, DecodedImage, ReducedScale};
use crate::colorspace::SourceInfo;
use crate::tags::{ensure_file_tag, file_has_tag, TAG_DEEP_DATA};
use exr::meta::attribute::{AttributeValue, SampleType};
use exr::meta::{BlockDescription, MetaData};
use image::Rgb32FImage;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

/// Single channels usable as grayscale, most useful first
const GRAYSCALE_PREFERENCE: &[&str] = &["Y", "Z", "depth", "A", "alpha", "luminance"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleKind {
    F16,
    F32,
    U32,
    /// Anything that is not a plain numeric sample
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExrChannelInfo {
    pub name: String,
    pub sample: SampleKind,
}

#[derive(Debug, Clone, Default)]
pub struct ExrHeader {
    pub width: u32,
    pub height: u32,
    /// Value of the `type` attribute (`scanlineimage`, `deeptile`, ...)
    pub part_type: Option<String>,
    pub channels: Vec<ExrChannelInfo>,
    /// Textual header attributes, renderer metadata included
    pub attributes: HashMap<String, String>,
}

impl ExrHeader {
    pub fn is_deep(&self) -> bool {
        let deep_type = self
            .part_type
            .as_deref()
            .is_some_and(|t| t.to_ascii_lowercase().contains("deep"));
        let non_numeric = matches!(
            self.channels.first().map(|c| &c.sample),
            Some(SampleKind::Other(_))
        );
        deep_type || non_numeric
    }
}

/// A named channel; `components > 1` means interleaved samples (e.g. `RGB`)
#[derive(Debug, Clone, PartialEq)]
pub struct ExrChannel {
    pub name: String,
    pub components: usize,
    pub samples: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExrPixels {
    pub width: u32,
    pub height: u32,
    pub channels: Vec<ExrChannel>,
}

impl ExrPixels {
    fn channel(&self, name: &str) -> Option<&ExrChannel> {
        self.channels.iter().find(|c| c.name == name)
    }

    fn names(&self) -> String {
        self.channels
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub trait ExrBackend: Send + Sync {
    fn read_header(&self, path: &Path) -> Result<ExrHeader, DecodeError>;

    /// Read every channel of the largest resolution level, reduced by `scale`
    fn read_channels(&self, path: &Path, scale: ReducedScale, target_size: u32)
        -> Result<ExrPixels, DecodeError>;
}

/// [`ExrBackend`] backed by the `exr` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeExr;

impl ExrBackend for NativeExr {
    fn read_header(&self, path: &Path) -> Result<ExrHeader, DecodeError> {
        let meta = MetaData::read_from_file(path, false)
            .map_err(|e| DecodeError::Backend(format!("exr header: {e}")))?;
        let header = meta
            .headers
            .first()
            .ok_or_else(|| DecodeError::InvalidData("exr file has no parts".into()))?;

        let scanlines = matches!(header.blocks, BlockDescription::ScanLines);
        let part_type = match (header.deep, scanlines) {
            (true, true) => "deepscanline",
            (true, false) => "deeptile",
            (false, true) => "scanlineimage",
            (false, false) => "tiledimage",
        };

        let channels = header
            .channels
            .list
            .iter()
            .map(|c| ExrChannelInfo {
                name: c.name.to_string(),
                sample: match c.sample_type {
                    SampleType::F16 => SampleKind::F16,
                    SampleType::F32 => SampleKind::F32,
                    SampleType::U32 => SampleKind::U32,
                },
            })
            .collect();

        let mut attributes = HashMap::new();
        let all = header
            .shared_attributes
            .other
            .iter()
            .chain(header.own_attributes.other.iter());
        for (name, value) in all {
            if let AttributeValue::Text(text) = value {
                attributes.insert(name.to_string(), text.to_string());
            }
        }

        Ok(ExrHeader {
            width: header.layer_size.0 as u32,
            height: header.layer_size.1 as u32,
            part_type: Some(part_type.to_string()),
            channels,
            attributes,
        })
    }

    fn read_channels(
        &self,
        path: &Path,
        scale: ReducedScale,
        target_size: u32,
    ) -> Result<ExrPixels, DecodeError> {
        use exr::prelude::*;

        let image = read()
            .no_deep_data()
            .largest_resolution_level()
            .all_channels()
            .all_layers()
            .all_attributes()
            .from_file(path)
            .map_err(|e| DecodeError::Backend(format!("exr pixels: {e}")))?;

        let mut width = 0;
        let mut height = 0;
        let mut channels = Vec::new();

        for layer in image.layer_data.iter() {
            let (w, h) = (layer.size.0 as u32, layer.size.1 as u32);
            if channels.is_empty() {
                width = w;
                height = h;
            } else if (w, h) != (width, height) {
                debug!(path = %path.display(), "skipping EXR layer with different size");
                continue;
            }

            let factor = scale.effective_for(w, h, target_size);
            let prefix = layer.attributes.layer_name.as_ref().map(|n| n.to_string());

            for channel in layer.channel_data.list.iter() {
                let name = match &prefix {
                    Some(p) => format!("{}.{}", p, channel.name),
                    None => channel.name.to_string(),
                };
                let samples: Vec<f32> = channel.sample_data.values_as_f32().collect();
                let (samples, _, _) = reduce_plane(&samples, w, h, 1, factor);
                channels.push(ExrChannel {
                    name,
                    components: 1,
                    samples,
                });
            }
        }

        let factor = scale.effective_for(width, height, target_size);
        Ok(ExrPixels {
            width: (width / factor).max(1),
            height: (height / factor).max(1),
            channels,
        })
    }
}

/// Pick RGB out of the available channels, interleaved.
///
/// Order: `RGB`, `RGBA`, `R/G/B`, `Beauty.R/G/B`, the first layer prefix with
/// `.R/.G/.B`, a single preferred channel as gray, the first channel as gray.
pub fn resolve_rgb(pixels: &ExrPixels) -> Result<Vec<f32>, DecodeError> {
    let count = pixels.width as usize * pixels.height as usize;

    for (name, components) in [("RGB", 3), ("RGBA", 4)] {
        if let Some(ch) = pixels.channel(name) {
            if ch.components >= components && ch.samples.len() >= count * ch.components {
                let rgb = ch
                    .samples
                    .chunks_exact(ch.components)
                    .take(count)
                    .flat_map(|px| [px[0], px[1], px[2]])
                    .collect();
                return Ok(rgb);
            }
        }
    }

    let mut prefixes = vec![String::new(), "Beauty.".to_string()];
    let layer_prefixes: BTreeSet<String> = pixels
        .channels
        .iter()
        .filter_map(|c| c.name.rsplit_once('.').map(|(p, _)| format!("{p}.")))
        .collect();
    prefixes.extend(layer_prefixes);

    for prefix in &prefixes {
        let planes = ["R", "G", "B"].map(|c| pixels.channel(&format!("{prefix}{c}")));
        if let [Some(r), Some(g), Some(b)] = planes {
            if [r, g, b].iter().all(|c| c.components == 1 && c.samples.len() >= count) {
                let mut rgb = Vec::with_capacity(count * 3);
                for i in 0..count {
                    rgb.extend_from_slice(&[r.samples[i], g.samples[i], b.samples[i]]);
                }
                return Ok(rgb);
            }
        }
    }

    let gray = GRAYSCALE_PREFERENCE
        .iter()
        .find_map(|name| pixels.channel(name))
        .or_else(|| pixels.channels.first());

    match gray {
        Some(ch) if ch.samples.len() >= count * ch.components => Ok(ch
            .samples
            .iter()
            .step_by(ch.components.max(1))
            .take(count)
            .flat_map(|v| [*v, *v, *v])
            .collect()),
        _ => Err(DecodeError::NoUsableChannels(pixels.names())),
    }
}

/// Tag the file as deep so later requests short-circuit
fn mark_deep(chain: &DecodeChain, path: &Path) {
    match ensure_file_tag(chain.tags.as_ref(), path, TAG_DEEP_DATA) {
        Ok(true) => info!(path = %path.display(), "tagged deep EXR"),
        Ok(false) => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to tag deep EXR"),
    }
}

pub(crate) fn decode_native(
    chain: &DecodeChain,
    path: &Path,
    target_size: u32,
) -> Result<DecodedImage, DecodeError> {
    if file_has_tag(chain.tags.as_ref(), path, TAG_DEEP_DATA) {
        return Err(DecodeError::Unsupported("deep EXR".into()));
    }

    let header = chain.exr.read_header(path)?;
    if header.is_deep() {
        mark_deep(chain, path);
        return Err(DecodeError::Unsupported("deep EXR".into()));
    }

    let colorspace = chain.working_colorspace(
        path,
        SourceInfo {
            channels: Some(header.channels.len()),
            width: Some(header.width),
            height: Some(header.height),
            metadata: Some(&header.attributes),
        },
    );

    let scale = ReducedScale::for_target(target_size);
    let pixels = match chain.exr.read_channels(path, scale, target_size) {
        Err(DecodeError::Unsupported(reason)) => {
            mark_deep(chain, path);
            return Err(DecodeError::Unsupported(reason));
        }
        other => other?,
    };

    let rgb = resolve_rgb(&pixels)?;
    let image = Rgb32FImage::from_raw(pixels.width, pixels.height, rgb)
        .ok_or_else(|| DecodeError::InvalidData("channel size mismatch".into()))?;

    let factor = (header.width / pixels.width.max(1)).max(1);
    debug!(
        path = %path.display(),
        source = ?(header.width, header.height),
        factor,
        "decoded EXR"
    );

    Ok(DecodedImage::from_rgb32f(fit_within_f32(image, target_size), colorspace)
        .with_source(header.width, header.height, factor))
}

/// Fallback through the `image` crate's own EXR support
pub(crate) fn decode_generic(
    chain: &DecodeChain,
    path: &Path,
    target_size: u32,
) -> Result<DecodedImage, DecodeError> {
    let image = image::open(path)?;
    let (width, height) = (image.width(), image.height());
    let colorspace = chain.working_colorspace(
        path,
        SourceInfo {
            channels: Some(image.color().channel_count() as usize),
            width: Some(width),
            height: Some(height),
            metadata: None,
        },
    );

    Ok(
        DecodedImage::from_rgb32f(fit_within_f32(image.to_rgb32f(), target_size), colorspace)
            .with_source(width, height, 1),
    )
}
