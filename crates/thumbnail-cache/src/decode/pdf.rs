//! PDF documents, rendered through an external [`DocumentRenderer`]
//!
//! No renderer is built in. Without one injected through
//! [`DecodeChain::with_document_renderer`](super::DecodeChain::with_document_renderer),
//! every PDF fails with [`DecodeError::BackendUnavailable`].

use super::resample::fit_within_u8;
use super::{DecodeError, DecodedImage};
use crate::colorspace::ColorTag;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Upper bound on the render zoom
const MAX_ZOOM: f32 = 2.0;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document is encrypted")]
    Encrypted,

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub bitmap: RgbImage,
    pub page_count: usize,
    /// Page size in points, e.g. `612x792`
    pub resolution: String,
}

pub trait DocumentRenderer: Send + Sync {
    /// Size of a page in points
    fn page_size(&self, path: &Path, page: usize) -> Result<(f32, f32), DocumentError>;

    fn render_page(&self, path: &Path, page: usize, zoom: f32) -> Result<RenderedPage, DocumentError>;
}

/// `min(target / width, target / height, 2.0)`
pub fn pdf_zoom(target_size: u32, width: f32, height: f32) -> f32 {
    if width <= 0.0 || height <= 0.0 {
        return 1.0;
    }
    let target = target_size as f32;
    (target / width).min(target / height).min(MAX_ZOOM)
}

impl From<DocumentError> for DecodeError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::Encrypted => DecodeError::Encrypted,
            DocumentError::Failed(message) => DecodeError::Backend(message),
        }
    }
}

pub(crate) fn decode_first_page(
    renderer: &dyn DocumentRenderer,
    path: &Path,
    target_size: u32,
) -> Result<DecodedImage, DecodeError> {
    let (width, height) = renderer.page_size(path, 0)?;
    let zoom = pdf_zoom(target_size, width, height);
    let page = renderer.render_page(path, 0, zoom)?;
    debug!(
        path = %path.display(),
        zoom,
        pages = page.page_count,
        resolution = %page.resolution,
        "rendered PDF page"
    );

    let (w, h) = page.bitmap.dimensions();
    Ok(DecodedImage::from_rgb8(fit_within_u8(page.bitmap, target_size), ColorTag::Unknown)
        .with_source(w, h, 1))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::decode::DecodeChain;
    use crate::formats::FormatTable;
    use crate::tags::MemoryTagStore;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Renderer producing a flat page, optionally refusing as encrypted
    pub(crate) struct FakeRenderer {
        pub encrypted: bool,
        pub zooms: Mutex<Vec<f32>>,
    }

    impl FakeRenderer {
        pub(crate) fn new(encrypted: bool) -> Self {
            Self {
                encrypted,
                zooms: Mutex::new(Vec::new()),
            }
        }
    }

    impl DocumentRenderer for FakeRenderer {
        fn page_size(&self, _path: &Path, _page: usize) -> Result<(f32, f32), DocumentError> {
            if self.encrypted {
                return Err(DocumentError::Encrypted);
            }
            Ok((612.0, 792.0))
        }

        fn render_page(&self, _path: &Path, _page: usize, zoom: f32) -> Result<RenderedPage, DocumentError> {
            self.zooms.lock().push(zoom);
            let (w, h) = ((612.0 * zoom) as u32, (792.0 * zoom) as u32);
            Ok(RenderedPage {
                bitmap: RgbImage::from_pixel(w, h, image::Rgb([255, 255, 255])),
                page_count: 3,
                resolution: "612x792".into(),
            })
        }
    }

    #[test]
    fn test_zoom_formula() {
        assert!((pdf_zoom(128, 612.0, 792.0) - 128.0 / 792.0).abs() < 1e-6);
        assert_eq!(pdf_zoom(2000, 100.0, 100.0), 2.0);
        assert_eq!(pdf_zoom(128, 0.0, 100.0), 1.0);
    }

    #[test]
    fn test_renders_first_page() {
        let renderer = Arc::new(FakeRenderer::new(false));
        let chain = DecodeChain::new(FormatTable::default(), Arc::new(MemoryTagStore::new()))
            .with_document_renderer(renderer.clone());

        let decoded = chain.decode(Path::new("/docs/brief.pdf"), 128).unwrap().unwrap();
        assert!(decoded.width <= 128 && decoded.height <= 128);
        assert_eq!(renderer.zooms.lock().len(), 1);
    }

    #[test]
    fn test_encrypted_is_distinct() {
        let chain = DecodeChain::new(FormatTable::default(), Arc::new(MemoryTagStore::new()))
            .with_document_renderer(Arc::new(FakeRenderer::new(true)));

        let result = chain.decode(Path::new("/docs/secret.pdf"), 128);
        assert!(matches!(result, Err(DecodeError::Encrypted)));
    }
}
