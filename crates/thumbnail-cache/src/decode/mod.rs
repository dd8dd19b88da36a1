//! Per-format decode strategies with ordered fallback
//!
//! Every extension maps to a [`ThumbnailMethod`], every method to an ordered list
//! of [`Strategy`] values. The chain runs the strategies in order and the first
//! `Ok` wins. Unsupported and encrypted outcomes stop the chain early, every
//! other error moves on to the next strategy.

pub mod exr;
pub mod pdf;
pub mod psd;
pub mod raster;
pub mod resample;
pub mod standard;

use crate::colorspace::{ColorTag, ColorspaceDetector, SourceInfo};
use crate::formats::{extension, FormatTable, ThumbnailMethod};
use crate::tags::{TagStore, TAG_ACESCG, TAG_LINEAR_SRGB};
use image::{Rgb32FImage, RgbImage};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub use exr::{ExrBackend, ExrChannel, ExrChannelInfo, ExrHeader, ExrPixels, NativeExr, SampleKind};
pub use pdf::{pdf_zoom, DocumentError, DocumentRenderer, RenderedPage};
pub use psd::{ImageResource, LayeredImageReader, PsdReader};

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Deep or volumetric data, never retried
    #[error("unsupported image: {0}")]
    Unsupported(String),

    #[error("document is password protected")]
    Encrypted,

    #[error("{0} backend is not available")]
    BackendUnavailable(&'static str),

    #[error("strategy does not apply to this file")]
    NotApplicable,

    #[error("no usable channels found (available: {0})")]
    NoUsableChannels(String),

    #[error("invalid image data: {0}")]
    InvalidData(String),

    #[error("{0}")]
    Backend(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("all {attempts} decode strategies failed, last error: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<DecodeError>,
    },

    #[error("no decode strategy for this file")]
    NoStrategy,
}

impl DecodeError {
    /// Outcomes that end the fallback chain instead of trying the next strategy
    pub fn is_terminal(&self) -> bool {
        matches!(self, DecodeError::Unsupported(_) | DecodeError::Encrypted)
    }
}

/// Reduced-resolution decode factor chosen from the thumbnail size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducedScale {
    Full,
    Half,
    Quarter,
    Eighth,
}

impl ReducedScale {
    /// ≤64 → 1/8, ≤128 → 1/4, ≤256 → 1/8, larger → 1/2
    pub fn for_target(target_size: u32) -> Self {
        match target_size {
            0..=64 => ReducedScale::Eighth,
            65..=128 => ReducedScale::Quarter,
            129..=256 => ReducedScale::Eighth,
            _ => ReducedScale::Half,
        }
    }

    pub fn denominator(self) -> u32 {
        match self {
            ReducedScale::Full => 1,
            ReducedScale::Half => 2,
            ReducedScale::Quarter => 4,
            ReducedScale::Eighth => 8,
        }
    }

    /// Factor actually usable for a source, never shrinking it below `target_size`
    pub fn effective_for(self, width: u32, height: u32, target_size: u32) -> u32 {
        let longest = width.max(height).max(1);
        let mut factor = self.denominator();
        while factor > 1 && longest / factor < target_size {
            factor /= 2;
        }
        factor
    }
}

/// Interleaved RGB pixels
#[derive(Debug, Clone, PartialEq)]
pub enum Pixels {
    /// Linear float, may exceed 1.0
    F32(Vec<f32>),
    /// Display-referred 8-bit
    U8(Vec<u8>),
}

/// Output of a successful decode, already fitted to the thumbnail size
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Pixels,
    pub source_colorspace: ColorTag,
    /// Dimensions of the file before any reduction
    pub source_width: u32,
    pub source_height: u32,
    /// Reduction applied at decode time (1 = full resolution)
    pub decode_factor: u32,
}

impl DecodedImage {
    pub fn from_rgb8(image: RgbImage, colorspace: ColorTag) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            pixels: Pixels::U8(image.into_raw()),
            source_colorspace: colorspace,
            source_width: width,
            source_height: height,
            decode_factor: 1,
        }
    }

    pub fn from_rgb32f(image: Rgb32FImage, colorspace: ColorTag) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            pixels: Pixels::F32(image.into_raw()),
            source_colorspace: colorspace,
            source_width: width,
            source_height: height,
            decode_factor: 1,
        }
    }

    pub fn with_source(mut self, width: u32, height: u32, decode_factor: u32) -> Self {
        self.source_width = width;
        self.source_height = height;
        self.decode_factor = decode_factor;
        self
    }

    pub fn is_float(&self) -> bool {
        matches!(self.pixels, Pixels::F32(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ExrNative,
    ExrGeneric,
    RadianceNative,
    HighBitNative,
    GenericRaster,
    PsdComposite,
    PsdEmbeddedPreview,
    PdfRender,
    ScaledJpeg,
    Standard,
}

/// Ordered strategies for a method and extension
pub fn strategies(method: ThumbnailMethod, ext: &str) -> &'static [Strategy] {
    use Strategy::*;
    match (method, ext) {
        (ThumbnailMethod::Exr, _) => &[ExrNative, ExrGeneric],
        (ThumbnailMethod::Radiance, _) => &[RadianceNative, GenericRaster],
        (ThumbnailMethod::HighBit, _) => &[HighBitNative, GenericRaster],
        (ThumbnailMethod::Psd, _) => &[PsdComposite, PsdEmbeddedPreview],
        (ThumbnailMethod::Pdf, _) => &[PdfRender],
        (ThumbnailMethod::Standard, "jpg" | "jpeg") => &[ScaledJpeg, Standard],
        (ThumbnailMethod::Standard, _) => &[Standard, GenericRaster],
        (ThumbnailMethod::None, _) => &[],
    }
}

/// Return the first `Ok`, stopping early on terminal errors.
///
/// Attempts are pulled lazily so later strategies only run when earlier ones fail.
pub fn first_ok<T>(
    attempts: impl IntoIterator<Item = Result<T, DecodeError>>,
) -> Result<T, DecodeError> {
    let mut tried = 0;
    let mut last = None;
    for attempt in attempts {
        tried += 1;
        match attempt {
            Ok(value) => return Ok(value),
            Err(e) if e.is_terminal() => return Err(e),
            Err(DecodeError::NotApplicable) => tried -= 1,
            Err(e) => last = Some(e),
        }
    }
    match last {
        Some(e) if tried == 1 => Err(e),
        Some(e) => Err(DecodeError::Exhausted {
            attempts: tried,
            last: Box::new(e),
        }),
        None => Err(DecodeError::NoStrategy),
    }
}

/// The decode front end used by the worker
pub struct DecodeChain {
    formats: FormatTable,
    tags: Arc<dyn TagStore>,
    detector: ColorspaceDetector,
    exr: Arc<dyn ExrBackend>,
    layered: Arc<dyn LayeredImageReader>,
    documents: Option<Arc<dyn DocumentRenderer>>,
}

impl DecodeChain {
    /// Chain with the built-in EXR and PSD readers and no document renderer
    pub fn new(formats: FormatTable, tags: Arc<dyn TagStore>) -> Self {
        Self {
            formats,
            tags,
            detector: ColorspaceDetector::new(),
            exr: Arc::new(NativeExr),
            layered: Arc::new(PsdReader),
            documents: None,
        }
    }

    pub fn with_exr_backend(mut self, backend: Arc<dyn ExrBackend>) -> Self {
        self.exr = backend;
        self
    }

    pub fn with_layered_reader(mut self, reader: Arc<dyn LayeredImageReader>) -> Self {
        self.layered = reader;
        self
    }

    pub fn with_document_renderer(mut self, renderer: Arc<dyn DocumentRenderer>) -> Self {
        self.documents = Some(renderer);
        self
    }

    pub fn formats(&self) -> &FormatTable {
        &self.formats
    }

    pub fn tag_store(&self) -> &Arc<dyn TagStore> {
        &self.tags
    }

    pub fn method_for(&self, path: &Path) -> ThumbnailMethod {
        self.formats.method_for(path)
    }

    /// Decode `path` fitted within `target_size`.
    ///
    /// `Ok(None)` means the extension has no thumbnail method.
    pub fn decode(&self, path: &Path, target_size: u32) -> Result<Option<DecodedImage>, DecodeError> {
        let method = self.method_for(path);
        if method == ThumbnailMethod::None {
            return Ok(None);
        }

        let ext = extension(path);
        let target_size = target_size.max(1);
        let attempts = strategies(method, &ext).iter().map(|strategy| {
            let result = self.run(*strategy, path, target_size);
            if let Err(e) = &result {
                if !matches!(e, DecodeError::NotApplicable) {
                    debug!(path = %path.display(), ?strategy, error = %e, "decode strategy failed");
                }
            }
            result
        });

        first_ok(attempts).map(Some)
    }

    fn run(&self, strategy: Strategy, path: &Path, target_size: u32) -> Result<DecodedImage, DecodeError> {
        match strategy {
            Strategy::ExrNative => exr::decode_native(self, path, target_size),
            Strategy::ExrGeneric => exr::decode_generic(self, path, target_size),
            Strategy::RadianceNative => raster::decode_radiance(self, path, target_size),
            Strategy::HighBitNative => raster::decode_high_bit(self, path, target_size),
            Strategy::GenericRaster => raster::decode_generic(self, path, target_size),
            Strategy::PsdComposite => psd::decode_composite(self.layered.as_ref(), path, target_size),
            Strategy::PsdEmbeddedPreview => psd::decode_embedded_preview(self.layered.as_ref(), path, target_size),
            Strategy::PdfRender => match &self.documents {
                Some(renderer) => pdf::decode_first_page(renderer.as_ref(), path, target_size),
                None => Err(DecodeError::BackendUnavailable("pdf")),
            },
            Strategy::ScaledJpeg => standard::decode_scaled_jpeg(path, target_size),
            Strategy::Standard => standard::decode_oriented(path, target_size),
        }
    }

    /// Working color space for an HDR source, auto-tagging it on first sight
    pub(crate) fn working_colorspace(&self, path: &Path, info: SourceInfo<'_>) -> ColorTag {
        if let Err(e) = self.detector.auto_tag(self.tags.as_ref(), path, info) {
            warn!(path = %path.display(), error = %e, "failed to persist color space tag");
        }
        match self.tags.file_metadata(path) {
            Ok(meta) if meta.has_tag(TAG_ACESCG) => ColorTag::AcesCg,
            Ok(meta) if meta.has_tag(TAG_LINEAR_SRGB) => ColorTag::LinearSrgb,
            _ => self.detector.classify(path, info).color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::MemoryTagStore;

    #[test]
    fn test_reduced_scale_thresholds() {
        assert_eq!(ReducedScale::for_target(32), ReducedScale::Eighth);
        assert_eq!(ReducedScale::for_target(64), ReducedScale::Eighth);
        assert_eq!(ReducedScale::for_target(65), ReducedScale::Quarter);
        assert_eq!(ReducedScale::for_target(128), ReducedScale::Quarter);
        assert_eq!(ReducedScale::for_target(256), ReducedScale::Eighth);
        assert_eq!(ReducedScale::for_target(512), ReducedScale::Half);
    }

    #[test]
    fn test_effective_factor_keeps_target_resolution() {
        // 4096 / 8 = 512 ≥ 256
        assert_eq!(ReducedScale::Eighth.effective_for(4096, 2048, 256), 8);
        // 1000 / 8 = 125 < 256, / 2 = 500
        assert_eq!(ReducedScale::Eighth.effective_for(1000, 500, 256), 2);
        assert_eq!(ReducedScale::Eighth.effective_for(100, 50, 256), 1);
    }

    #[test]
    fn test_first_ok_stops_at_first_success() {
        let mut calls = 0;
        let attempts = [1, 2, 3].iter().map(|n| {
            calls += 1;
            if *n == 2 {
                Ok(*n)
            } else {
                Err(DecodeError::Backend(format!("attempt {n}")))
            }
        });
        assert_eq!(first_ok(attempts).unwrap(), 2);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_first_ok_terminal_and_exhausted() {
        let result: Result<(), _> = first_ok([
            Err(DecodeError::Encrypted),
            Err(DecodeError::Backend("unreached".into())),
        ]);
        assert!(matches!(result, Err(DecodeError::Encrypted)));

        let result: Result<(), _> = first_ok([
            Err(DecodeError::Backend("a".into())),
            Err(DecodeError::Backend("b".into())),
        ]);
        match result {
            Err(DecodeError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last.to_string(), "b");
            }
            other => panic!("unexpected {other:?}"),
        }

        let result: Result<(), _> = first_ok(std::iter::empty());
        assert!(matches!(result, Err(DecodeError::NoStrategy)));
    }

    #[test]
    fn test_none_method_is_not_a_failure() {
        let chain = DecodeChain::new(FormatTable::default(), Arc::new(MemoryTagStore::new()));
        let result = chain.decode(Path::new("/scenes/shot.ma"), 128).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_pdf_without_renderer_fails() {
        let chain = DecodeChain::new(FormatTable::default(), Arc::new(MemoryTagStore::new()));
        let result = chain.decode(Path::new("/docs/brief.pdf"), 128);
        assert!(matches!(result, Err(DecodeError::BackendUnavailable("pdf"))));
    }

    #[test]
    fn test_strategy_table() {
        assert_eq!(
            strategies(ThumbnailMethod::Standard, "jpg"),
            &[Strategy::ScaledJpeg, Strategy::Standard]
        );
        assert_eq!(
            strategies(ThumbnailMethod::Exr, "exr"),
            &[Strategy::ExrNative, Strategy::ExrGeneric]
        );
        assert!(strategies(ThumbnailMethod::None, "ma").is_empty());
    }
}
