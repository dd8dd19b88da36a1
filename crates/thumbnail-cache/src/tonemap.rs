//! Scene-linear to display transforms
//!
//! Two variants:
//!
//! - **ACES**: AP1 → AP0, Narkowicz RRT+ODT fit, AP0 → linear sRGB, sRGB EOTF.
//!   A fixed −1 stop is added to the exposure to match renderer brightness.
//! - **Standard**: Reinhard `x / (1 + x)` followed by a 2.2 gamma.
//!
//! Both clamp to [0, 1] and stay finite for any input, NaN and infinity included.

use crate::bitmap::ThumbnailBitmap;
use crate::decode::{DecodedImage, Pixels};
use crate::tags::{FileMetadata, TAG_ACESCG, TAG_VIEW_ACES};
use rayon::prelude::*;

/// Exposure offset applied whenever the ACES transform is selected
pub const ACES_COMPENSATION_STOPS: f32 = -1.0;

/// Rec.709 luma weights
pub const LUMA_REC709: [f32; 3] = [0.2126, 0.7152, 0.0722];

/// Inputs beyond this are treated as this; keeps the filmic fit out of f32 overflow
const MAX_LINEAR: f32 = 1.0e6;

const AP1_TO_AP0: [[f32; 3]; 3] = [
    [0.695_452_24, 0.140_678_7, 0.163_869_06],
    [0.044_794_563, 0.859_671_1, 0.095_534_32],
    [-0.005_525_883, 0.004_025_21, 1.001_500_7],
];

const AP0_TO_SRGB: [[f32; 3]; 3] = [
    [2.521_686_2, -1.134_131, -0.387_555_2],
    [-0.275_146_96, 1.372_719, -0.097_571_999],
    [-0.015_339_397, -0.152_681_59, 1.168_021],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewTransform {
    Aces,
    Standard,
}

impl ViewTransform {
    /// ACES iff the file is tagged `ACEScg` or `sRGB(ACES)`
    pub fn for_metadata(meta: &FileMetadata) -> Self {
        if meta.has_tag(TAG_ACESCG) || meta.has_tag(TAG_VIEW_ACES) {
            ViewTransform::Aces
        } else {
            ViewTransform::Standard
        }
    }
}

fn mul(m: &[[f32; 3]; 3], v: [f32; 3]) -> [f32; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

fn sanitize(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(-MAX_LINEAR, MAX_LINEAR)
    }
}

fn exposed(rgb: [f32; 3], stops: f32) -> [f32; 3] {
    let gain = 2f32.powf(stops);
    rgb.map(|v| sanitize(sanitize(v) * gain))
}

/// Narkowicz 2015 fit
fn rrt_odt_fit(x: f32) -> f32 {
    const A: f32 = 2.51;
    const B: f32 = 0.03;
    const C: f32 = 2.43;
    const D: f32 = 0.59;
    const E: f32 = 0.14;
    let x = x.max(0.0);
    (x * (A * x + B)) / (x * (C * x + D) + E)
}

/// IEC 61966-2-1 encoding
pub fn srgb_encode(v: f32) -> f32 {
    if v <= 0.003_130_8 {
        12.92 * v
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

/// ACES RRT+ODT for sRGB displays, `stops` already including any compensation
pub fn aces(rgb: [f32; 3], stops: f32) -> [f32; 3] {
    let ap0 = mul(&AP1_TO_AP0, exposed(rgb, stops)).map(rrt_odt_fit);
    mul(&AP0_TO_SRGB, ap0).map(|v| srgb_encode(v.max(0.0)).clamp(0.0, 1.0))
}

/// Reinhard + 2.2 gamma
pub fn standard(rgb: [f32; 3], stops: f32) -> [f32; 3] {
    exposed(rgb, stops).map(|v| {
        let v = v.max(0.0);
        (v / (1.0 + v)).powf(1.0 / 2.2).clamp(0.0, 1.0)
    })
}

/// Blend each pixel toward its Rec.709 luma; `saturation = 0` is grayscale
pub fn rgb_to_saturation(rgb: [f32; 3], saturation: f32) -> [f32; 3] {
    let luma = luma(rgb);
    rgb.map(|v| luma + saturation * (v - luma))
}

/// Scale luma and chroma independently, both normalized by 48
pub fn rgb_to_yc(rgb: [f32; 3], luma_scale: f32, chroma_scale: f32) -> [f32; 3] {
    let luma = luma(rgb);
    rgb.map(|v| luma * luma_scale / 48.0 + (v - luma) * (chroma_scale / 48.0))
}

fn luma(rgb: [f32; 3]) -> f32 {
    LUMA_REC709[0] * rgb[0] + LUMA_REC709[1] * rgb[1] + LUMA_REC709[2] * rgb[2]
}

fn to_u8(v: f32) -> u8 {
    (v * 255.0 + 0.5) as u8
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneMapper {
    pub transform: ViewTransform,
    /// User exposure in stops
    pub exposure: f32,
}

impl ToneMapper {
    pub fn new(transform: ViewTransform, exposure: f32) -> Self {
        Self {
            transform,
            exposure,
        }
    }

    /// Select the variant from the file's tags
    pub fn for_metadata(meta: &FileMetadata, exposure: f32) -> Self {
        Self::new(ViewTransform::for_metadata(meta), exposure)
    }

    /// Exposure actually applied, compensation included
    pub fn effective_exposure(&self) -> f32 {
        match self.transform {
            ViewTransform::Aces => self.exposure + ACES_COMPENSATION_STOPS,
            ViewTransform::Standard => self.exposure,
        }
    }

    pub fn map_pixel(&self, rgb: [f32; 3]) -> [f32; 3] {
        let stops = self.effective_exposure();
        match self.transform {
            ViewTransform::Aces => aces(rgb, stops),
            ViewTransform::Standard => standard(rgb, stops),
        }
    }

    /// Produce the display bitmap. 8-bit sources are already display-referred and pass through.
    pub fn apply(&self, image: &DecodedImage) -> ThumbnailBitmap {
        let bytes = match &image.pixels {
            Pixels::U8(px) => px.clone(),
            Pixels::F32(px) => {
                let mut out = vec![0u8; px.len()];
                let row = image.width as usize * 3;
                out.par_chunks_mut(row.max(3))
                    .zip(px.par_chunks(row.max(3)))
                    .for_each(|(dst, src)| {
                        for (d, s) in dst.chunks_exact_mut(3).zip(src.chunks_exact(3)) {
                            let mapped = self.map_pixel([s[0], s[1], s[2]]);
                            d.copy_from_slice(&mapped.map(to_u8));
                        }
                    });
                out
            }
        };

        ThumbnailBitmap::new(image.width, image.height, bytes).unwrap_or_else(|_| {
            ThumbnailBitmap::from_rgb_image(image::RgbImage::new(image.width, image.height))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colorspace::ColorTag;
    use crate::tags::Tag;

    fn in_unit(rgb: [f32; 3]) -> bool {
        rgb.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v))
    }

    #[test]
    fn test_outputs_stay_in_unit_range() {
        let inputs = [
            0.0,
            1e-6,
            0.18,
            1.0,
            16.0,
            1e4,
            1e12,
            f32::MAX,
            f32::INFINITY,
            f32::NAN,
            -5.0,
        ];
        for x in inputs {
            for stops in [-4.0, 0.0, 6.0] {
                assert!(in_unit(aces([x, x, x], stops)), "aces({x}, {stops})");
                assert!(in_unit(standard([x, x, x], stops)), "standard({x}, {stops})");
                assert!(in_unit(aces([x, 0.0, 0.5], stops)));
            }
        }
    }

    #[test]
    fn test_standard_reference_values() {
        let [v, _, _] = standard([1.0, 1.0, 1.0], 0.0);
        assert!((v - 0.5f32.powf(1.0 / 2.2)).abs() < 1e-6);

        // +1 stop doubles the input
        let [a, _, _] = standard([0.5, 0.5, 0.5], 1.0);
        assert!((a - v).abs() < 1e-6);
    }

    #[test]
    fn test_aces_is_monotonic_on_gray() {
        let mut last = -1.0;
        for i in 0..200 {
            let x = i as f32 * 0.05;
            let [v, _, _] = aces([x, x, x], 0.0);
            assert!(v >= last - 1e-6, "not monotonic at {x}");
            last = v;
        }
        assert!(aces([0.0; 3], 0.0).iter().all(|v| *v < 0.01));
        assert!(aces([100.0; 3], 0.0).iter().all(|v| *v > 0.95));
    }

    #[test]
    fn test_srgb_encode_segments() {
        assert!((srgb_encode(0.002) - 0.02584).abs() < 1e-6);
        assert!((srgb_encode(1.0) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_selection_by_tags() {
        let tag = |name: &str| Tag {
            id: 1,
            name: name.into(),
            category: None,
            color: None,
        };
        let mut meta = FileMetadata::default();
        assert_eq!(ViewTransform::for_metadata(&meta), ViewTransform::Standard);

        meta.tags.push(tag("srgb(aces)"));
        assert_eq!(ViewTransform::for_metadata(&meta), ViewTransform::Aces);

        meta.tags = vec![tag("Linear sRGB")];
        assert_eq!(ViewTransform::for_metadata(&meta), ViewTransform::Standard);
    }

    #[test]
    fn test_aces_compensation_stacks_with_exposure() {
        let mapper = ToneMapper::new(ViewTransform::Aces, 0.5);
        assert_eq!(mapper.effective_exposure(), -0.5);
        assert_eq!(mapper.map_pixel([0.18; 3]), aces([0.18; 3], -0.5));

        let mapper = ToneMapper::new(ViewTransform::Standard, 0.5);
        assert_eq!(mapper.effective_exposure(), 0.5);
    }

    #[test]
    fn test_apply_float_and_passthrough() {
        let mapper = ToneMapper::new(ViewTransform::Standard, 0.0);
        let float = DecodedImage::from_rgb32f(
            image::Rgb32FImage::from_pixel(3, 2, image::Rgb([1.0, 0.0, 1e9])),
            ColorTag::LinearSrgb,
        );
        let bitmap = mapper.apply(&float);
        assert_eq!((bitmap.width(), bitmap.height()), (3, 2));
        assert_eq!(bitmap.pixel(2, 1), Some([to_u8(0.5f32.powf(1.0 / 2.2)), 0, 255]));

        let bytes = DecodedImage::from_rgb8(
            image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3])),
            ColorTag::Unknown,
        );
        assert_eq!(mapper.apply(&bytes).pixel(1, 1), Some([1, 2, 3]));
    }

    #[test]
    fn test_saturation_helpers() {
        let gray = rgb_to_saturation([1.0, 0.0, 0.0], 0.0);
        assert!((gray[0] - 0.2126).abs() < 1e-6);
        assert_eq!(gray[0], gray[1]);

        assert_eq!(rgb_to_saturation([0.3, 0.6, 0.9], 1.0), [0.3, 0.6, 0.9]);

        let yc = rgb_to_yc([0.5, 0.5, 0.5], 48.0, 48.0);
        assert!((yc[0] - 0.5).abs() < 1e-6);
    }
}
