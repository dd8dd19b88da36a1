//! Radiance HDR, TIFF/TGA and generic raster decoding via the `image` crate
//!
//! The `image` decoders for these formats always produce full resolution. The
//! [`ReducedScale`] factor is applied as stride decimation right after decoding, so
//! it saves resampling and tone-mapping work, not decode time.

use super::resample::{fit_within_f32, fit_within_u8, reduce_rgb32f};
use super::standard::source_limits;
use super::{DecodeChain, DecodeError, DecodedImage, ReducedScale};
use crate::colorspace::{ColorTag, SourceInfo};
use crate::formats::extension;
use image::{DynamicImage, ImageFormat, ImageReader, Rgb32FImage, RgbImage};
use std::path::Path;
use tracing::debug;

fn open(path: &Path, format: Option<ImageFormat>) -> Result<DynamicImage, DecodeError> {
    let mut reader = ImageReader::open(path)?;
    reader.limits(source_limits());
    match format {
        Some(format) => reader.set_format(format),
        None => reader = reader.with_guessed_format()?,
    }
    Ok(reader.decode()?)
}

fn source_info(image: &DynamicImage) -> SourceInfo<'static> {
    SourceInfo {
        channels: Some(image.color().channel_count() as usize),
        width: Some(image.width()),
        height: Some(image.height()),
        metadata: None,
    }
}

/// Radiance RGBE, always Linear sRGB. Full decode, then decimated by the reduced-scale factor.
pub(crate) fn decode_radiance(
    chain: &DecodeChain,
    path: &Path,
    target_size: u32,
) -> Result<DecodedImage, DecodeError> {
    let image = open(path, Some(ImageFormat::Hdr))?;
    let (width, height) = (image.width(), image.height());
    let colorspace = chain.working_colorspace(path, source_info(&image));

    let factor = ReducedScale::for_target(target_size).effective_for(width, height, target_size);
    let reduced = reduce_rgb32f(image.to_rgb32f(), factor);
    debug!(path = %path.display(), factor, "decoded Radiance HDR");

    Ok(DecodedImage::from_rgb32f(fit_within_f32(reduced, target_size), colorspace)
        .with_source(width, height, factor))
}

/// TIFF/TX/TGA at any bit depth. Full decode, then decimated by the reduced-scale factor.
pub(crate) fn decode_high_bit(
    chain: &DecodeChain,
    path: &Path,
    target_size: u32,
) -> Result<DecodedImage, DecodeError> {
    let image = open(path, None)?;
    let (width, height) = (image.width(), image.height());
    let factor = ReducedScale::for_target(target_size).effective_for(width, height, target_size);

    let decoded = match &image {
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
            let colorspace = if extension(path) == "tx" {
                chain.working_colorspace(path, source_info(&image))
            } else {
                ColorTag::Unknown
            };
            let mut float = image.to_rgb32f();
            normalize_float(&mut float);
            let reduced = reduce_rgb32f(float, factor);
            DecodedImage::from_rgb32f(fit_within_f32(reduced, target_size), colorspace)
        }
        DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_) => {
            let rgb = sixteen_to_eight(&image);
            DecodedImage::from_rgb8(fit_within_u8(reduce_rgb8(rgb, factor), target_size), ColorTag::Unknown)
        }
        _ => {
            let rgb = image.to_rgb8();
            DecodedImage::from_rgb8(fit_within_u8(reduce_rgb8(rgb, factor), target_size), ColorTag::Unknown)
        }
    };

    Ok(decoded.with_source(width, height, factor))
}

/// Last-resort decode of anything the `image` crate recognises
pub(crate) fn decode_generic(
    _chain: &DecodeChain,
    path: &Path,
    target_size: u32,
) -> Result<DecodedImage, DecodeError> {
    let image = open(path, None)?;
    let (width, height) = (image.width(), image.height());

    let decoded = if matches!(
        image,
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_)
    ) {
        DecodedImage::from_rgb32f(fit_within_f32(image.to_rgb32f(), target_size), ColorTag::Unknown)
    } else {
        DecodedImage::from_rgb8(fit_within_u8(image.to_rgb8(), target_size), ColorTag::Unknown)
    };
    Ok(decoded.with_source(width, height, 1))
}

/// 16-bit to 8-bit by integer division by 257, after conversion to RGB order
fn sixteen_to_eight(image: &DynamicImage) -> RgbImage {
    let rgb16 = image.to_rgb16();
    let (w, h) = rgb16.dimensions();
    let bytes = rgb16.into_raw().into_iter().map(|v| (v / 257) as u8).collect();
    RgbImage::from_raw(w, h, bytes).unwrap_or_else(|| RgbImage::new(w, h))
}

fn reduce_rgb8(image: RgbImage, factor: u32) -> RgbImage {
    if factor <= 1 {
        return image;
    }
    let (w, h) = image.dimensions();
    let (tw, th) = ((w / factor).max(1), (h / factor).max(1));
    image::imageops::resize(&image, tw, th, image::imageops::FilterType::Triangle)
}

/// Bring float data into a tone-mappable range without hard clipping.
///
/// Uses percentiles as a soft white point and keeps headroom above 1.0.
pub fn normalize_float(image: &mut Rgb32FImage) {
    let data: &mut [f32] = image;
    let finite: Vec<f32> = data.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return;
    }

    let min = finite.iter().copied().fold(f32::INFINITY, f32::min);
    let max = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    if min >= 0.0 && max <= 1.0 {
        return;
    }

    let mut sorted = finite;
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));

    let apply = |data: &mut [f32], divisor: f32, ceiling: f32| {
        if divisor > 0.0 {
            for v in data.iter_mut() {
                *v = (*v / divisor).clamp(0.0, ceiling);
            }
        }
    };

    if max > 100.0 {
        let p90 = percentile(&sorted, 90.0);
        if p90 > 0.1 {
            apply(data, p90 * 2.0, 10.0);
        } else {
            apply(data, percentile(&sorted, 99.0), 5.0);
        }
    } else if max > 10.0 {
        let p95 = percentile(&sorted, 95.0);
        if p95 > 1.0 {
            apply(data, p95, 2.0);
        }
    } else if min < 0.0 {
        let range = max - min;
        if range > 0.0 {
            for v in data.iter_mut() {
                *v = (*v - min) / range;
            }
        }
    } else {
        apply(data, max.max(2.0), f32::MAX);
    }
}

/// Nearest-rank percentile of sorted data
fn percentile(sorted: &[f32], p: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * (sorted.len() - 1) as f32).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Pixels;
    use crate::formats::FormatTable;
    use crate::tags::{MemoryTagStore, TagStore, TAG_LINEAR_SRGB};
    use anyhow::Result;
    use std::sync::Arc;

    fn image_from(values: &[f32]) -> Rgb32FImage {
        let mut data = Vec::new();
        for v in values {
            data.extend_from_slice(&[*v, *v, *v]);
        }
        Rgb32FImage::from_raw(values.len() as u32, 1, data).unwrap()
    }

    #[test]
    fn test_display_range_is_untouched() {
        let mut img = image_from(&[0.0, 0.5, 1.0]);
        normalize_float(&mut img);
        assert_eq!(img.get_pixel(1, 0)[0], 0.5);
    }

    #[test]
    fn test_huge_values_use_p90_white_point() {
        let mut values = vec![1.0; 95];
        values.extend([500.0; 5]);
        let mut img = image_from(&values);
        normalize_float(&mut img);
        // p90 = 1.0, divisor 2.0, clamp at 10
        assert_eq!(img.get_pixel(0, 0)[0], 0.5);
        assert_eq!(img.get_pixel(99, 0)[0], 10.0);
    }

    #[test]
    fn test_moderate_overrange_uses_p95() {
        let mut values = vec![4.0; 97];
        values.extend([50.0; 3]);
        let mut img = image_from(&values);
        normalize_float(&mut img);
        assert_eq!(img.get_pixel(0, 0)[0], 1.0);
        assert_eq!(img.get_pixel(99, 0)[0], 2.0);
    }

    #[test]
    fn test_negative_values_shift() {
        let mut img = image_from(&[-1.0, 0.0, 1.0]);
        normalize_float(&mut img);
        assert_eq!(img.get_pixel(0, 0)[0], 0.0);
        assert_eq!(img.get_pixel(1, 0)[0], 0.5);
        assert_eq!(img.get_pixel(2, 0)[0], 1.0);
    }

    #[test]
    fn test_slightly_overrange_divides_by_at_least_two() {
        let mut img = image_from(&[0.5, 1.5]);
        normalize_float(&mut img);
        assert_eq!(img.get_pixel(1, 0)[0], 0.75);
    }

    #[test]
    fn test_sixteen_bit_divides_by_257() {
        let img = image::ImageBuffer::<image::Rgb<u16>, _>::from_raw(1, 1, vec![65535u16, 257, 0])
            .unwrap();
        let rgb = sixteen_to_eight(&DynamicImage::ImageRgb16(img));
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 1, 0]);
    }

    #[test]
    fn test_sixteen_bit_tiff_decodes_to_u8() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("plate.tif");
        let img = image::ImageBuffer::<image::Rgb<u16>, _>::from_pixel(64, 32, image::Rgb([65535u16, 32896, 0]));
        DynamicImage::ImageRgb16(img).save(&path)?;

        let chain = DecodeChain::new(FormatTable::default(), Arc::new(MemoryTagStore::new()));
        let decoded = chain.decode(&path, 128)?.unwrap();
        assert_eq!((decoded.width, decoded.height), (64, 32));
        match decoded.pixels {
            Pixels::U8(px) => assert_eq!(&px[..3], &[255, 128, 0]),
            Pixels::F32(_) => panic!("16-bit TIFF must decode to 8-bit"),
        }
        Ok(())
    }

    #[test]
    fn test_radiance_is_tagged_linear() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sky_aces.hdr");
        let img = Rgb32FImage::from_pixel(512, 256, image::Rgb([4.0, 2.0, 1.0]));
        DynamicImage::ImageRgb32F(img).save(&path)?;

        let store = Arc::new(MemoryTagStore::new());
        let chain = DecodeChain::new(FormatTable::default(), store.clone());
        let decoded = chain.decode(&path, 64)?.unwrap();

        assert_eq!(decoded.source_colorspace, ColorTag::LinearSrgb);
        assert_eq!(decoded.decode_factor, 8);
        assert_eq!((decoded.width, decoded.height), (64, 32));
        assert!(store.file_metadata(&path)?.has_tag(TAG_LINEAR_SRGB));
        assert!(decoded.is_float());
        Ok(())
    }
}
