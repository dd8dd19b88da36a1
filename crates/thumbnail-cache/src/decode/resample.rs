//! Downsampling helpers shared by the decoders

use image::imageops::{self, FilterType};
use image::{Rgb32FImage, RgbImage};

/// Dimensions fitting inside a `max` square, keeping aspect ratio
pub fn fit_dimensions(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width <= max && height <= max {
        return (width.max(1), height.max(1));
    }
    let scale = max as f64 / width.max(height) as f64;
    (
        ((width as f64 * scale).round() as u32).max(1),
        ((height as f64 * scale).round() as u32).max(1),
    )
}

/// Box-average a plane by an integer factor.
///
/// Blocks on the right and bottom edges are clipped to the image.
pub fn reduce_plane(
    samples: &[f32],
    width: u32,
    height: u32,
    components: usize,
    factor: u32,
) -> (Vec<f32>, u32, u32) {
    if factor <= 1 || samples.len() < width as usize * height as usize * components {
        return (samples.to_vec(), width, height);
    }

    let (w, h) = (width as usize, height as usize);
    let f = factor as usize;
    let out_w = (w / f).max(1);
    let out_h = (h / f).max(1);
    let mut out = vec![0.0f32; out_w * out_h * components];

    for oy in 0..out_h {
        let y0 = oy * f;
        let y1 = (y0 + f).min(h);
        for ox in 0..out_w {
            let x0 = ox * f;
            let x1 = (x0 + f).min(w);
            let n = ((y1 - y0) * (x1 - x0)) as f32;
            for c in 0..components {
                let mut sum = 0.0f64;
                for y in y0..y1 {
                    let row = y * w;
                    for x in x0..x1 {
                        sum += samples[(row + x) * components + c] as f64;
                    }
                }
                out[(oy * out_w + ox) * components + c] = (sum / n as f64) as f32;
            }
        }
    }

    (out, out_w as u32, out_h as u32)
}

/// Box-average an RGB float image by an integer factor
pub fn reduce_rgb32f(image: Rgb32FImage, factor: u32) -> Rgb32FImage {
    if factor <= 1 {
        return image;
    }
    let (width, height) = image.dimensions();
    let (samples, w, h) = reduce_plane(image.as_raw(), width, height, 3, factor);
    Rgb32FImage::from_raw(w, h, samples).unwrap_or(image)
}

/// Area-style downsample of float RGB to fit within `max`.
///
/// The integer part of the ratio is box-averaged, the remainder goes through
/// a triangle filter.
pub fn fit_within_f32(image: Rgb32FImage, max: u32) -> Rgb32FImage {
    let (width, height) = image.dimensions();
    let (tw, th) = fit_dimensions(width, height, max);
    if (tw, th) == (width, height) {
        return image;
    }

    let whole = (width / tw).min(height / th).max(1);
    let image = reduce_rgb32f(image, whole);
    if image.dimensions() == (tw, th) {
        return image;
    }
    imageops::resize(&image, tw, th, FilterType::Triangle)
}

/// Downsample 8-bit RGB to fit within `max`
pub fn fit_within_u8(image: RgbImage, max: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let (tw, th) = fit_dimensions(width, height, max);
    if (tw, th) == (width, height) {
        return image;
    }
    imageops::resize(&image, tw, th, FilterType::Lanczos3)
}
