//! The display-ready RGB8 thumbnail stored in both cache tiers

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::fmt;

/// An 8-bit RGB thumbnail, tightly packed row-major
#[derive(Clone, PartialEq, Eq)]
pub struct ThumbnailBitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl ThumbnailBitmap {
    /// Wrap packed RGB8 bytes, checking that the buffer matches the dimensions
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            bail!(
                "Bitmap buffer is {} bytes, expected {} for {}x{}",
                pixels.len(),
                expected,
                width,
                height
            );
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            pixels: image.into_raw(),
        }
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// RGB triple at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]])
    }

    /// Approximate heap footprint
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }

    /// Encode as baseline JPEG at the given quality (clamped to 1..=100)
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode(
                &self.pixels,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .context("Failed to encode thumbnail JPEG")?;
        Ok(out)
    }

    /// Decode a cached JPEG back into a bitmap
    pub fn decode_jpeg(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
            .context("Failed to decode cached thumbnail")?;
        Ok(Self::from_rgb_image(image.to_rgb8()))
    }
}

impl fmt::Debug for ThumbnailBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailBitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}
