use std::fmt;

use crate::caching::CacheError;
use crate::utils::compression::decompress;

/// Compressed textures are rejected once they inflate beyond this size.
const MAX_TEXTURE_SIZE: u64 = 64 * 1024 * 1024;

const OPCODE_I32: i32 = 0x2000;
const OPCODE_I16: i32 = 0x3000;
const OPCODE_I8: i32 = 0x4000;

const ELEVATION_HEADER_SIZE: usize = 16;

const DDS_MAGIC: &[u8; 4] = b"DDS ";
const DDS_HEADER_SIZE: u32 = 124;

/// Turns downloaded bytes into the payload of a tile.
pub trait TileDecoder: fmt::Debug + Send + Sync + 'static {
    type Payload: fmt::Debug + Send + Sync + 'static;

    /// A short name of the payload kind, used in logs and metrics.
    const KIND: &'static str;

    fn decode(&self, data: &[u8]) -> Result<Self::Payload, CacheError>;
}

/// A grid of elevation samples in metres.
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationGrid {
    pub width: u32,
    pub height: u32,
    /// Row-major samples, `width * height` of them.
    pub samples: Vec<f32>,
}

impl ElevationGrid {
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.samples
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }
}

/// Decodes big-endian elevation grids.
///
/// The payload starts with four `i32` values: the sample opcode, the width, the height and the
/// height scale in thousandths of a metre. The samples follow, their size depending on the
/// opcode.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElevationDecoder;

impl TileDecoder for ElevationDecoder {
    type Payload = ElevationGrid;

    const KIND: &'static str = "elevation";

    fn decode(&self, data: &[u8]) -> Result<ElevationGrid, CacheError> {
        let header = data
            .get(..ELEVATION_HEADER_SIZE)
            .ok_or_else(|| malformed("elevation header is truncated"))?;
        let field = |i: usize| i32::from_be_bytes([
            header[i * 4],
            header[i * 4 + 1],
            header[i * 4 + 2],
            header[i * 4 + 3],
        ]);
        let (opcode, width, height, h_scale) = (field(0), field(1), field(2), field(3));

        let sample_size = match opcode {
            OPCODE_I32 => 4,
            OPCODE_I16 => 2,
            OPCODE_I8 => 1,
            _ => return Err(malformed(format!("unknown elevation opcode {opcode:#x}"))),
        };
        let (Ok(width), Ok(height)) = (u32::try_from(width), u32::try_from(height)) else {
            return Err(malformed(format!("invalid grid size {width}x{height}")));
        };

        let count = width as usize * height as usize;
        let expected = count
            .checked_mul(sample_size)
            .and_then(|n| n.checked_add(ELEVATION_HEADER_SIZE));
        if expected != Some(data.len()) {
            return Err(malformed(format!(
                "expected {width}x{height} samples of {sample_size} bytes, got {} bytes",
                data.len()
            )));
        }

        let scale = h_scale as f32 / 1000.0;
        let body = &data[ELEVATION_HEADER_SIZE..];
        let samples = body
            .chunks_exact(sample_size)
            .map(|chunk| {
                let raw = match *chunk {
                    [a, b, c, d] => i32::from_be_bytes([a, b, c, d]),
                    [a, b] => i16::from_be_bytes([a, b]) as i32,
                    [a] => a as i8 as i32,
                    _ => 0,
                };
                raw as f32 * scale
            })
            .collect();

        Ok(ElevationGrid {
            width,
            height,
            samples,
        })
    }
}

/// A DDS texture, kept in its GPU-ready block compressed form.
#[derive(Clone, PartialEq)]
pub struct DdsTexture {
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
    pub fourcc: [u8; 4],
    /// Everything following the header.
    pub data: Vec<u8>,
}

impl fmt::Debug for DdsTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DdsTexture")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("mip_count", &self.mip_count)
            .field("fourcc", &String::from_utf8_lossy(&self.fourcc))
            .field("data", &format_args!("[{} bytes]", self.data.len()))
            .finish()
    }
}

/// A decoded texture.
#[derive(Clone, PartialEq)]
pub enum TextureImage {
    Compressed(DdsTexture),
    Rgba8 {
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    },
}

impl TextureImage {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Compressed(dds) => (dds.width, dds.height),
            Self::Rgba8 { width, height, .. } => (*width, *height),
        }
    }
}

impl fmt::Debug for TextureImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compressed(dds) => f.debug_tuple("Compressed").field(dds).finish(),
            Self::Rgba8 { width, height, .. } => f
                .debug_struct("Rgba8")
                .field("width", width)
                .field("height", height)
                .finish_non_exhaustive(),
        }
    }
}

/// Decodes DDS, JPEG and PNG textures, optionally compressed with gzip, zlib or zstd.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextureDecoder;

impl TileDecoder for TextureDecoder {
    type Payload = TextureImage;

    const KIND: &'static str = "texture";

    fn decode(&self, data: &[u8]) -> Result<TextureImage, CacheError> {
        let data = decompress(data, MAX_TEXTURE_SIZE)
            .map_err(|e| malformed(format!("failed to decompress texture: {e}")))?;

        if data.starts_with(DDS_MAGIC) {
            return parse_dds(&data).map(TextureImage::Compressed);
        }

        let image = image::load_from_memory(&data)
            .map_err(|e| malformed(format!("failed to decode image: {e}")))?
            .to_rgba8();
        Ok(TextureImage::Rgba8 {
            width: image.width(),
            height: image.height(),
            pixels: image.into_raw(),
        })
    }
}

fn parse_dds(data: &[u8]) -> Result<DdsTexture, CacheError> {
    // The header follows the 4 byte magic, all offsets are relative to the file start.
    let body_offset = DDS_MAGIC.len() + DDS_HEADER_SIZE as usize;
    if data.len() < body_offset {
        return Err(malformed("DDS header is truncated"));
    }
    let u32_at = |offset: usize| {
        u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ])
    };

    let header_size = u32_at(4);
    if header_size != DDS_HEADER_SIZE {
        return Err(malformed(format!("invalid DDS header size {header_size}")));
    }

    Ok(DdsTexture {
        height: u32_at(12),
        width: u32_at(16),
        mip_count: u32_at(28).max(1),
        fourcc: [data[84], data[85], data[86], data[87]],
        data: data[body_offset..].to_vec(),
    })
}

fn malformed(reason: impl Into<String>) -> CacheError {
    CacheError::Malformed(reason.into())
}
