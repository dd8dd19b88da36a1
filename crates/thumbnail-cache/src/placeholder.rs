//! Gradient tiles for files without a real thumbnail

use crate::bitmap::ThumbnailBitmap;
use image::{Rgb, RgbImage};

type Gradient = ([u8; 3], [u8; 3]);

const DEFAULT_GRADIENT: Gradient = ([100, 100, 100], [150, 150, 150]);

/// Top and bottom colors per extension
const SCHEMES: &[(&str, Gradient)] = &[
    // 3D and scene files
    ("ma", ([50, 150, 180], [80, 200, 230])),
    ("mb", ([40, 130, 160], [70, 180, 210])),
    ("obj", ([150, 80, 150], [200, 130, 200])),
    ("fbx", ([200, 180, 60], [255, 220, 100])),
    ("abc", ([80, 150, 80], [120, 200, 120])),
    ("usd", ([200, 80, 80], [255, 120, 120])),
    ("vdb", ([100, 100, 200], [150, 150, 255])),
    ("hda", ([180, 100, 60], [220, 140, 100])),
    ("blend", ([50, 120, 200], [80, 160, 240])),
    ("sbsar", ([220, 120, 40], [255, 160, 80])),
    ("dae", ([150, 80, 150], [200, 130, 200])),
    ("stl", ([150, 80, 150], [200, 130, 200])),
    // Images
    ("tif", ([100, 180, 220], [140, 210, 255])),
    ("tiff", ([100, 180, 220], [140, 210, 255])),
    ("jpg", ([220, 180, 100], [255, 210, 140])),
    ("jpeg", ([220, 180, 100], [255, 210, 140])),
    ("png", ([180, 220, 180], [210, 255, 210])),
    ("hdr", ([255, 200, 100], [255, 230, 150])),
    ("exr", ([220, 140, 220], [255, 180, 255])),
    ("tga", ([180, 180, 220], [210, 210, 255])),
    // Scripts and documents
    ("py", ([60, 120, 180], [100, 160, 220])),
    ("mel", ([70, 160, 100], [100, 200, 140])),
    ("txt", ([160, 160, 160], [200, 200, 200])),
    ("pdf", ([200, 50, 50], [255, 100, 100])),
];

const MARGIN: u32 = 2;
const CORNER_RADIUS: f32 = 8.0;
const BORDER_WIDTH: f32 = 2.0;
/// Border darkening, black at roughly 24% opacity
const BORDER_ALPHA: f32 = 60.0 / 255.0;

/// Gradient colors for an extension, with or without the leading dot
pub fn gradient_for(extension: &str) -> Gradient {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    SCHEMES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, g)| *g)
        .unwrap_or(DEFAULT_GRADIENT)
}

fn lerp(a: [u8; 3], b: [u8; 3], t: f32) -> [u8; 3] {
    let mix = |i: usize| (a[i] as f32 + (b[i] as f32 - a[i] as f32) * t).round() as u8;
    [mix(0), mix(1), mix(2)]
}

/// Signed distance from a point to a rounded rectangle, negative inside
fn rounded_rect_distance(px: f32, py: f32, (x0, y0, x1, y1): (f32, f32, f32, f32), radius: f32) -> f32 {
    let cx = (x0 + x1) / 2.0;
    let cy = (y0 + y1) / 2.0;
    let hw = (x1 - x0) / 2.0 - radius;
    let hh = (y1 - y0) / 2.0 - radius;
    let dx = ((px - cx).abs() - hw).max(0.0);
    let dy = ((py - cy).abs() - hh).max(0.0);
    let outside = (dx * dx + dy * dy).sqrt();
    let inside = ((px - cx).abs() - hw).max((py - cy).abs() - hh).min(0.0);
    outside + inside - radius
}

/// Square placeholder tile for `extension`: a rounded vertical gradient with a darker rim
/// on a black background
pub fn placeholder(extension: &str, size: u32) -> ThumbnailBitmap {
    let size = size.max(MARGIN * 2 + 1);
    let (top, bottom) = gradient_for(extension);
    let bounds = (
        MARGIN as f32,
        MARGIN as f32,
        (size - MARGIN) as f32,
        (size - MARGIN) as f32,
    );
    let radius = CORNER_RADIUS.min((size - 2 * MARGIN) as f32 / 2.0);
    let span = (size - 1).max(1) as f32;

    let img = RgbImage::from_fn(size, size, |x, y| {
        let d = rounded_rect_distance(x as f32 + 0.5, y as f32 + 0.5, bounds, radius);
        if d > 0.0 {
            return Rgb([0, 0, 0]);
        }
        let color = lerp(top, bottom, y as f32 / span);
        if d > -BORDER_WIDTH {
            Rgb(color.map(|c| (c as f32 * (1.0 - BORDER_ALPHA)).round() as u8))
        } else {
            Rgb(color)
        }
    });

    ThumbnailBitmap::from_rgb_image(img)
}
