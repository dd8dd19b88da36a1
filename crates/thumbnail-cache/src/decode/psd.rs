//! Photoshop documents: merged composite first, embedded preview second

use super::resample::fit_within_u8;
use super::{DecodeError, DecodedImage};
use crate::colorspace::ColorTag;
use image::{ImageFormat, RgbImage};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

/// Preview resource written by Photoshop 5 and later (RGB)
pub const RESOURCE_THUMBNAIL: u16 = 1036;
/// Preview resource written by Photoshop 4 (BGR)
pub const RESOURCE_THUMBNAIL_LEGACY: u16 = 1033;

const THUMBNAIL_HEADER_LEN: usize = 28;
/// Largest width or height a version 1 document may declare
const MAX_DIMENSION: u32 = 30_000;

/// One block of the image-resource section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResource {
    pub id: u16,
    pub name: String,
    pub data: Vec<u8>,
}

pub trait LayeredImageReader: Send + Sync {
    /// Flattened document as 8-bit RGB
    fn composite(&self, path: &Path) -> Result<RgbImage, DecodeError>;

    /// Raw image-resource blocks, without decoding pixel data
    fn image_resources(&self, path: &Path) -> Result<Vec<ImageResource>, DecodeError>;
}

/// Built-in reader for version 1 PSD files (8/16-bit gray and RGB)
#[derive(Debug, Clone, Copy, Default)]
pub struct PsdReader;

#[derive(Debug, Clone, Copy)]
struct PsdHeader {
    channels: u16,
    height: u32,
    width: u32,
    depth: u16,
    color_mode: u16,
}

fn read_u16(r: &mut impl Read) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_header(r: &mut impl Read) -> Result<PsdHeader, DecodeError> {
    let mut signature = [0u8; 4];
    r.read_exact(&mut signature)?;
    if &signature != b"8BPS" {
        return Err(DecodeError::InvalidData("not a PSD file".into()));
    }
    let version = read_u16(r)?;
    if version != 1 {
        return Err(DecodeError::InvalidData(format!("PSD version {version} not supported")));
    }
    let mut reserved = [0u8; 6];
    r.read_exact(&mut reserved)?;

    Ok(PsdHeader {
        channels: read_u16(r)?,
        height: read_u32(r)?,
        width: read_u32(r)?,
        depth: read_u16(r)?,
        color_mode: read_u16(r)?,
    })
}

/// Skip a length-prefixed section
fn skip_section<R: Read + Seek>(r: &mut R) -> Result<(), DecodeError> {
    let len = read_u32(r)?;
    r.seek(SeekFrom::Current(len as i64))?;
    Ok(())
}

fn be_u16(data: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes(data.get(pos..pos + 2)?.try_into().ok()?))
}

fn be_u32(data: &[u8], pos: usize) -> Option<u32> {
    Some(u32::from_be_bytes(data.get(pos..pos + 4)?.try_into().ok()?))
}

/// Parse the body of the image-resource section
pub fn parse_resources(block: &[u8]) -> Result<Vec<ImageResource>, DecodeError> {
    let mut resources = Vec::new();
    let mut pos = 0;
    let truncated = || DecodeError::InvalidData("truncated image resource".into());

    while pos + 4 <= block.len() {
        if &block[pos..pos + 4] != b"8BIM" {
            // Other signatures (MeSa, ...) share the layout but carry nothing we read
            debug!(offset = pos, "non-8BIM image resource");
        }
        pos += 4;

        let id = be_u16(block, pos).ok_or_else(truncated)?;
        pos += 2;

        let name_len = *block.get(pos).ok_or_else(truncated)? as usize;
        let name = block.get(pos + 1..pos + 1 + name_len).ok_or_else(truncated)?;
        let name = String::from_utf8_lossy(name).into_owned();
        // length byte + name, padded to even
        let padded = (1 + name_len + 1) & !1;
        pos += padded;

        let size = be_u32(block, pos).ok_or_else(truncated)? as usize;
        pos += 4;

        let data = block.get(pos..pos + size).ok_or_else(truncated)?.to_vec();
        pos += (size + 1) & !1;

        resources.push(ImageResource { id, name, data });
    }

    Ok(resources)
}

/// Decode a 1036/1033 thumbnail resource
pub fn decode_thumbnail_resource(resource: &ImageResource) -> Result<RgbImage, DecodeError> {
    let data = &resource.data;
    if data.len() < THUMBNAIL_HEADER_LEN {
        return Err(DecodeError::InvalidData("thumbnail resource too short".into()));
    }
    let field = |i: usize| be_u32(data, i).unwrap_or(0);
    let format = field(0);
    let width = field(4);
    let height = field(8);
    let width_bytes = field(12) as usize;
    let payload = &data[THUMBNAIL_HEADER_LEN..];

    let mut image = match format {
        1 => image::load_from_memory_with_format(payload, ImageFormat::Jpeg)?.to_rgb8(),
        0 => {
            let row_len = width as usize * 3;
            if row_len == 0 || width_bytes < row_len || payload.len() < width_bytes * height as usize {
                return Err(DecodeError::InvalidData("raw thumbnail truncated".into()));
            }
            let mut pixels = Vec::with_capacity(row_len * height as usize);
            for row in payload.chunks_exact(width_bytes).take(height as usize) {
                pixels.extend_from_slice(&row[..row_len]);
            }
            RgbImage::from_raw(width, height, pixels)
                .ok_or_else(|| DecodeError::InvalidData("raw thumbnail size".into()))?
        }
        other => {
            return Err(DecodeError::InvalidData(format!("thumbnail format {other}")));
        }
    };

    if resource.id == RESOURCE_THUMBNAIL_LEGACY {
        for px in image.pixels_mut() {
            px.0.swap(0, 2);
        }
    }
    Ok(image)
}

/// PackBits decode into exactly `expected` bytes
fn unpack_bits(src: &[u8], expected: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(expected);
    let mut i = 0;
    while i < src.len() && out.len() < expected {
        let n = src[i] as i8;
        i += 1;
        if n >= 0 {
            let end = (i + n as usize + 1).min(src.len());
            out.extend_from_slice(&src[i..end]);
            i = end;
        } else if n != -128 {
            let count = (1 - n as i32) as usize;
            if let Some(&b) = src.get(i) {
                out.extend(std::iter::repeat(b).take(count));
                i += 1;
            }
        }
    }
    if out.len() < expected {
        return Err(DecodeError::InvalidData("RLE row too short".into()));
    }
    out.truncate(expected);
    Ok(out)
}

/// Decode the merged image-data section into planar rows per channel
fn decode_planes(header: &PsdHeader, data: &[u8], wanted: usize) -> Result<Vec<Vec<u8>>, DecodeError> {
    let bytes_per_sample = (header.depth / 8) as usize;
    let row_len = header.width as usize * bytes_per_sample;
    let plane_len = row_len * header.height as usize;
    let rows = header.height as usize;
    let total_channels = header.channels as usize;

    if data.len() < 2 {
        return Err(DecodeError::InvalidData("missing image data".into()));
    }
    let compression = u16::from_be_bytes([data[0], data[1]]);
    let body = &data[2..];

    match compression {
        0 => (0..wanted)
            .map(|c| {
                body.get(c * plane_len..(c + 1) * plane_len)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| DecodeError::InvalidData("raw image data truncated".into()))
            })
            .collect(),
        1 => {
            let table_len = total_channels * rows * 2;
            let table = body
                .get(..table_len)
                .ok_or_else(|| DecodeError::InvalidData("RLE table truncated".into()))?;
            let counts: Vec<usize> = table
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]) as usize)
                .collect();

            let mut offset = table_len;
            let mut planes = Vec::with_capacity(wanted);
            for c in 0..wanted {
                let mut plane = Vec::with_capacity(plane_len);
                for row in 0..rows {
                    let len = *counts
                        .get(c * rows + row)
                        .ok_or_else(|| DecodeError::InvalidData("RLE table has too few rows".into()))?;
                    let src = body
                        .get(offset..offset + len)
                        .ok_or_else(|| DecodeError::InvalidData("RLE data truncated".into()))?;
                    plane.extend(unpack_bits(src, row_len)?);
                    offset += len;
                }
                planes.push(plane);
            }
            Ok(planes)
        }
        other => Err(DecodeError::InvalidData(format!("PSD compression {other} not supported"))),
    }
}

impl LayeredImageReader for PsdReader {
    fn composite(&self, path: &Path) -> Result<RgbImage, DecodeError> {
        let mut reader = BufReader::new(File::open(path)?);
        let header = read_header(&mut reader)?;

        let wanted = match header.color_mode {
            1 | 8 => 1,
            3 if header.channels >= 3 => 3,
            mode => {
                return Err(DecodeError::InvalidData(format!(
                    "PSD color mode {mode} with {} channels not supported",
                    header.channels
                )))
            }
        };
        if (header.channels as usize) < wanted {
            return Err(DecodeError::InvalidData(format!(
                "PSD declares {} channels, color mode {} needs {wanted}",
                header.channels, header.color_mode
            )));
        }
        if header.depth != 8 && header.depth != 16 {
            return Err(DecodeError::InvalidData(format!("PSD depth {} not supported", header.depth)));
        }
        if header.width > MAX_DIMENSION || header.height > MAX_DIMENSION {
            return Err(DecodeError::InvalidData(format!(
                "PSD dimensions {}x{} exceed {MAX_DIMENSION}",
                header.width, header.height
            )));
        }

        skip_section(&mut reader)?; // color mode data
        skip_section(&mut reader)?; // image resources
        skip_section(&mut reader)?; // layer and mask info

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let planes = decode_planes(&header, &data, wanted)?;

        let count = header.width as usize * header.height as usize;
        let sample = |plane: &[u8], i: usize| -> u8 {
            if header.depth == 16 {
                (u16::from_be_bytes([plane[i * 2], plane[i * 2 + 1]]) / 257) as u8
            } else {
                plane[i]
            }
        };

        let mut pixels = Vec::with_capacity(count * 3);
        for i in 0..count {
            if wanted == 1 {
                let v = sample(&planes[0], i);
                pixels.extend_from_slice(&[v, v, v]);
            } else {
                pixels.extend_from_slice(&[
                    sample(&planes[0], i),
                    sample(&planes[1], i),
                    sample(&planes[2], i),
                ]);
            }
        }

        RgbImage::from_raw(header.width, header.height, pixels)
            .ok_or_else(|| DecodeError::InvalidData("composite size mismatch".into()))
    }

    fn image_resources(&self, path: &Path) -> Result<Vec<ImageResource>, DecodeError> {
        let mut reader = BufReader::new(File::open(path)?);
        read_header(&mut reader)?;
        skip_section(&mut reader)?;

        let len = read_u32(&mut reader)? as usize;
        let mut block = Vec::new();
        (&mut reader).take(len as u64).read_to_end(&mut block)?;
        if block.len() < len {
            return Err(DecodeError::InvalidData(format!(
                "image resource section truncated ({} of {len} bytes)",
                block.len()
            )));
        }
        parse_resources(&block)
    }
}

pub(crate) fn decode_composite(
    reader: &dyn LayeredImageReader,
    path: &Path,
    target_size: u32,
) -> Result<DecodedImage, DecodeError> {
    let image = reader.composite(path)?;
    let (width, height) = image.dimensions();
    Ok(DecodedImage::from_rgb8(fit_within_u8(image, target_size), ColorTag::Unknown)
        .with_source(width, height, 1))
}

pub(crate) fn decode_embedded_preview(
    reader: &dyn LayeredImageReader,
    path: &Path,
    target_size: u32,
) -> Result<DecodedImage, DecodeError> {
    let resources = reader.image_resources(path)?;
    let resource = resources
        .iter()
        .find(|r| r.id == RESOURCE_THUMBNAIL)
        .or_else(|| resources.iter().find(|r| r.id == RESOURCE_THUMBNAIL_LEGACY))
        .ok_or_else(|| DecodeError::InvalidData("no embedded thumbnail".into()))?;

    let image = decode_thumbnail_resource(resource)?;
    debug!(path = %path.display(), id = resource.id, "using embedded PSD preview");
    let (width, height) = image.dimensions();
    Ok(DecodedImage::from_rgb8(fit_within_u8(image, target_size), ColorTag::Unknown)
        .with_source(width, height, 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodeChain, Pixels};
    use crate::formats::FormatTable;
    use crate::tags::MemoryTagStore;
    use anyhow::Result;
    use std::sync::Arc;

    fn resource_block(id: u16, data: &[u8]) -> Vec<u8> {
        let mut out = b"8BIM".to_vec();
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&[0, 0]); // empty pascal name, padded
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(0);
        }
        out
    }

    /// Raw (format 0) thumbnail resource payload
    fn raw_thumbnail(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let width_bytes = (width * 24 + 31) / 32 * 4;
        let mut out = Vec::new();
        for v in [0, width, height, width_bytes, width_bytes * height, 0] {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out.extend_from_slice(&24u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        for _ in 0..height {
            let mut row = Vec::new();
            for _ in 0..width {
                row.extend_from_slice(&rgb);
            }
            row.resize(width_bytes as usize, 0);
            out.extend(row);
        }
        out
    }

    /// Header plus the three length-prefixed sections, image data left to the caller
    fn psd_prefix(channels: u16, width: u32, height: u32, color_mode: u16, resources: &[u8]) -> Vec<u8> {
        let mut out = b"8BPS".to_vec();
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&[0; 6]);
        out.extend_from_slice(&channels.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&8u16.to_be_bytes());
        out.extend_from_slice(&color_mode.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&(resources.len() as u32).to_be_bytes());
        out.extend_from_slice(resources);
        out.extend_from_slice(&0u32.to_be_bytes());
        out
    }

    /// Minimal 8-bit RGB PSD with raw image data
    fn build_psd(width: u32, height: u32, rgb: [u8; 3], resources: &[u8]) -> Vec<u8> {
        let mut out = b"8BPS".to_vec();
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&[0; 6]);
        out.extend_from_slice(&3u16.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&8u16.to_be_bytes());
        out.extend_from_slice(&3u16.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&(resources.len() as u32).to_be_bytes());
        out.extend_from_slice(resources);
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        for channel in rgb {
            out.extend(std::iter::repeat(channel).take((width * height) as usize));
        }
        out
    }

    #[test]
    fn test_unpack_bits() {
        // literal run of 2, then 3 repeats of 0xAA
        let src = [1, 0x01, 0x02, 0xFE, 0xAA];
        assert_eq!(unpack_bits(&src, 5).unwrap(), vec![1, 2, 0xAA, 0xAA, 0xAA]);
        assert!(unpack_bits(&src, 8).is_err());
    }

    #[test]
    fn test_parse_resources_with_odd_sizes() {
        let mut block = resource_block(1005, &[1, 2, 3]);
        block.extend(resource_block(RESOURCE_THUMBNAIL, &[9; 4]));
        let resources = parse_resources(&block).unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].data, vec![1, 2, 3]);
        assert_eq!(resources[1].id, RESOURCE_THUMBNAIL);
    }

    #[test]
    fn test_legacy_thumbnail_is_bgr() {
        let resource = ImageResource {
            id: RESOURCE_THUMBNAIL_LEGACY,
            name: String::new(),
            data: raw_thumbnail(3, 2, [10, 20, 30]),
        };
        let image = decode_thumbnail_resource(&resource).unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(2, 1).0, [30, 20, 10]);
    }

    #[test]
    fn test_composite_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("layout.psd");
        std::fs::write(&path, build_psd(4, 2, [200, 100, 50], &[]))?;

        let image = PsdReader.composite(&path)?;
        assert_eq!(image.dimensions(), (4, 2));
        assert_eq!(image.get_pixel(3, 1).0, [200, 100, 50]);
        Ok(())
    }

    struct BrokenComposite;

    impl LayeredImageReader for BrokenComposite {
        fn composite(&self, _path: &Path) -> Result<RgbImage, DecodeError> {
            Err(DecodeError::Backend("layers unreadable".into()))
        }

        fn image_resources(&self, path: &Path) -> Result<Vec<ImageResource>, DecodeError> {
            PsdReader.image_resources(path)
        }
    }

    #[test]
    fn test_falls_back_to_embedded_preview() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("paint.psd");
        let resources = resource_block(RESOURCE_THUMBNAIL, &raw_thumbnail(8, 4, [1, 2, 3]));
        std::fs::write(&path, build_psd(16, 8, [200, 100, 50], &resources))?;

        let chain = DecodeChain::new(FormatTable::default(), Arc::new(MemoryTagStore::new()))
            .with_layered_reader(Arc::new(BrokenComposite));
        let decoded = chain.decode(&path, 128)?.unwrap();

        assert_eq!((decoded.width, decoded.height), (8, 4));
        match decoded.pixels {
            Pixels::U8(px) => assert_eq!(&px[..3], &[1, 2, 3]),
            Pixels::F32(_) => panic!("PSD previews are 8-bit"),
        }
        Ok(())
    }

    #[test]
    fn test_grayscale_rle_without_channels_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("empty_gray.psd");
        let mut bytes = psd_prefix(0, 2, 2, 1, &[]);
        bytes.extend_from_slice(&1u16.to_be_bytes());
        std::fs::write(&path, bytes)?;

        assert!(matches!(PsdReader.composite(&path), Err(DecodeError::InvalidData(_))));

        let chain = DecodeChain::new(FormatTable::default(), Arc::new(MemoryTagStore::new()));
        assert!(chain.decode(&path, 64).is_err());
        Ok(())
    }

    #[test]
    fn test_channel_less_composite_falls_back_to_preview() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gray_preview.psd");
        let resources = resource_block(RESOURCE_THUMBNAIL, &raw_thumbnail(4, 2, [7, 8, 9]));
        let mut bytes = psd_prefix(0, 2, 2, 1, &resources);
        bytes.extend_from_slice(&1u16.to_be_bytes());
        std::fs::write(&path, bytes)?;

        let chain = DecodeChain::new(FormatTable::default(), Arc::new(MemoryTagStore::new()));
        let decoded = chain.decode(&path, 64)?.unwrap();
        assert_eq!((decoded.width, decoded.height), (4, 2));
        Ok(())
    }

    #[test]
    fn test_short_rle_table_is_an_error() {
        let header = PsdHeader {
            channels: 1,
            height: 4,
            width: 2,
            depth: 8,
            color_mode: 3,
        };
        // one channel's worth of row counts, three channels requested
        let mut data = 1u16.to_be_bytes().to_vec();
        data.extend(std::iter::repeat([0u8, 3]).take(4).flatten());
        data.extend(std::iter::repeat([1u8, 5, 6]).take(4).flatten());
        assert!(matches!(decode_planes(&header, &data, 3), Err(DecodeError::InvalidData(_))));
    }

    #[test]
    fn test_oversized_resource_section_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("huge_resources.psd");
        let mut bytes = psd_prefix(3, 2, 2, 3, &[]);
        // resource length claims 4 GiB, file holds a few bytes
        let len_at = 26 + 4;
        bytes[len_at..len_at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        std::fs::write(&path, bytes)?;

        assert!(matches!(
            PsdReader.image_resources(&path),
            Err(DecodeError::InvalidData(_))
        ));
        Ok(())
    }
}
