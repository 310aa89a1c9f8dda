//! Minimal dimension parsers for JPEG, PNG, GIF and WebP (VP8/VP8L/VP8X).
//!
//! Each parser reads only the headers it needs and returns `None` rather
//! than guessing when the bytes don't match the expected layout.

use super::format::ImageFormat;

/// Pixel dimensions parsed from file bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    fn new(width: u32, height: u32) -> Option<Self> {
        (width > 0 && height > 0).then_some(Self { width, height })
    }
}

/// Detect dimensions for a known format.
pub fn detect(format: ImageFormat, bytes: &[u8]) -> Option<Dimensions> {
    match format {
        ImageFormat::Jpeg => jpeg_dimensions(bytes),
        ImageFormat::Png => png_dimensions(bytes),
        ImageFormat::Gif => gif_dimensions(bytes),
        ImageFormat::Webp => webp_dimensions(bytes),
    }
}

fn read_u16_be(bytes: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
        *bytes.get(offset)?,
        *bytes.get(offset + 1)?,
    ]))
}

fn read_u16_le(bytes: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes([
        *bytes.get(offset)?,
        *bytes.get(offset + 1)?,
    ]))
}

fn read_u32_be(bytes: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_be_bytes([
        *bytes.get(offset)?,
        *bytes.get(offset + 1)?,
        *bytes.get(offset + 2)?,
        *bytes.get(offset + 3)?,
    ]))
}

fn read_u24_le(bytes: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes([
        *bytes.get(offset)?,
        *bytes.get(offset + 1)?,
        *bytes.get(offset + 2)?,
        0,
    ]))
}

/// PNG: 8-byte signature, then the IHDR chunk with width and height as
/// big-endian u32 at offsets 16 and 20.
fn png_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    if bytes.len() < 24 || bytes[..8] != SIGNATURE || &bytes[12..16] != b"IHDR" {
        return None;
    }
    Dimensions::new(read_u32_be(bytes, 16)?, read_u32_be(bytes, 20)?)
}

/// GIF87a/GIF89a: logical screen width and height as little-endian u16 at
/// offsets 6 and 8.
fn gif_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    if bytes.len() < 10 || (!bytes.starts_with(b"GIF87a") && !bytes.starts_with(b"GIF89a")) {
        return None;
    }
    Some(Dimensions {
        width: u32::from(read_u16_le(bytes, 6)?),
        height: u32::from(read_u16_le(bytes, 8)?),
    })
    .filter(|d| d.width > 0 && d.height > 0)
}

/// JPEG: walk the marker segments until a start-of-frame marker, which
/// carries height then width as big-endian u16 after the precision byte.
fn jpeg_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return None;
    }

    let mut offset = 2usize;
    loop {
        // Seek the next marker, skipping fill bytes.
        while *bytes.get(offset)? != 0xFF {
            offset += 1;
        }
        while *bytes.get(offset)? == 0xFF {
            offset += 1;
        }
        let marker = *bytes.get(offset)?;
        offset += 1;

        match marker {
            // Standalone markers carry no length.
            0x01 | 0xD0..=0xD8 => continue,
            // End of image / start of scan: no frame header found.
            0xD9 | 0xDA => return None,
            // Start-of-frame family, excluding DHT/JPG/DAC.
            0xC0..=0xCF if marker != 0xC4 && marker != 0xC8 && marker != 0xCC => {
                let height = u32::from(read_u16_be(bytes, offset + 3)?);
                let width = u32::from(read_u16_be(bytes, offset + 5)?);
                return Dimensions::new(width, height);
            }
            _ => {
                let length = usize::from(read_u16_be(bytes, offset)?);
                if length < 2 {
                    return None;
                }
                offset += length;
            }
        }
    }
}

/// WebP: RIFF container, then the first chunk decides the flavour.
fn webp_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    if bytes.len() < 30 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return None;
    }

    match &bytes[12..16] {
        // Lossy: frame tag, then the 9D 01 2A start code, then 14-bit
        // width and height.
        b"VP8 " => {
            if bytes[23..26] != [0x9D, 0x01, 0x2A] {
                return None;
            }
            let width = u32::from(read_u16_le(bytes, 26)? & 0x3FFF);
            let height = u32::from(read_u16_le(bytes, 28)? & 0x3FFF);
            Dimensions::new(width, height)
        }
        // Lossless: 0x2F signature byte, then width-1 and height-1 packed
        // into 14-bit fields.
        b"VP8L" => {
            if bytes[20] != 0x2F {
                return None;
            }
            let packed = u32::from_le_bytes([bytes[21], bytes[22], bytes[23], bytes[24]]);
            let width = (packed & 0x3FFF) + 1;
            let height = ((packed >> 14) & 0x3FFF) + 1;
            Dimensions::new(width, height)
        }
        // Extended: canvas width-1 and height-1 as 24-bit little-endian.
        b"VP8X" => {
            let width = read_u24_le(bytes, 24)? + 1;
            let height = read_u24_le(bytes, 27)? + 1;
            Dimensions::new(width, height)
        }
        _ => None,
    }
}
