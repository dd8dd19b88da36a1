//! 8-bit formats: DCT-scaled JPEG decode and EXIF orientation

use super::resample::fit_within_u8;
use super::{DecodeError, DecodedImage};
use crate::colorspace::ColorTag;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader, RgbImage};
use jpeg_decoder::{Decoder as JpegDecoder, PixelFormat};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Larger sources are refused instead of decoded
pub const MAX_SOURCE_DIM: u32 = 20_000;
const MAX_DECODE_BYTES: u64 = (MAX_SOURCE_DIM as u64) * (MAX_SOURCE_DIM as u64) * 4;

pub(super) fn source_limits() -> image::Limits {
    let mut limits = image::Limits::default();
    limits.max_image_width = Some(MAX_SOURCE_DIM);
    limits.max_image_height = Some(MAX_SOURCE_DIM);
    limits
}

/// Decode a JPEG at the smallest DCT scale still covering `target_size`
pub(crate) fn decode_scaled_jpeg(path: &Path, target_size: u32) -> Result<DecodedImage, DecodeError> {
    let file = File::open(path)?;
    let mut decoder = JpegDecoder::new(BufReader::new(file));
    decoder.set_max_decoding_buffer_size(MAX_DECODE_BYTES.min(usize::MAX as u64) as usize);
    decoder
        .read_info()
        .map_err(|e| DecodeError::Backend(format!("jpeg header: {e}")))?;
    let info = decoder
        .info()
        .ok_or_else(|| DecodeError::InvalidData("jpeg without frame header".into()))?;
    let (source_w, source_h) = (info.width as u32, info.height as u32);
    if source_w > MAX_SOURCE_DIM || source_h > MAX_SOURCE_DIM {
        return Err(DecodeError::Unsupported(format!(
            "{source_w}x{source_h} exceeds the {MAX_SOURCE_DIM} pixel source limit"
        )));
    }

    let request = target_size.min(u16::MAX as u32) as u16;
    let (w, h) = decoder
        .scale(request, request)
        .map_err(|e| DecodeError::Backend(format!("jpeg scale: {e}")))?;

    let data = decoder
        .decode()
        .map_err(|e| DecodeError::Backend(format!("jpeg decode: {e}")))?;
    let (w, h) = (w as u32, h as u32);

    let rgb = match info.pixel_format {
        PixelFormat::RGB24 => RgbImage::from_raw(w, h, data),
        PixelFormat::L8 => RgbImage::from_raw(w, h, data.iter().flat_map(|v| [*v, *v, *v]).collect()),
        // CMYK and 16-bit gray go through the general decoder
        _ => return Err(DecodeError::NotApplicable),
    }
    .ok_or_else(|| DecodeError::InvalidData("jpeg buffer size mismatch".into()))?;

    let mut image = DynamicImage::ImageRgb8(rgb);
    if let Some(orientation) = decoder.exif_data().and_then(Orientation::from_exif_chunk) {
        image.apply_orientation(orientation);
    }

    let factor = (source_w / w.max(1)).max(1);
    Ok(DecodedImage::from_rgb8(fit_within_u8(image.to_rgb8(), target_size), ColorTag::Unknown)
        .with_source(source_w, source_h, factor))
}

/// General decode honouring the stored orientation
pub(crate) fn decode_oriented(path: &Path, target_size: u32) -> Result<DecodedImage, DecodeError> {
    let mut reader = ImageReader::open(path)?.with_guessed_format()?;
    reader.limits(source_limits());
    let mut decoder = reader.into_decoder()?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut image = DynamicImage::from_decoder(decoder)?;
    let (width, height) = (image.width(), image.height());
    image.apply_orientation(orientation);

    Ok(DecodedImage::from_rgb8(fit_within_u8(image.to_rgb8(), target_size), ColorTag::Unknown)
        .with_source(width, height, 1))
}
