use std::borrow::Cow;
use std::io::{self, Read};

use flate2::read::{MultiGzDecoder, ZlibDecoder};

/// Decompresses `data` if it starts with a known compression signature.
///
/// Uncompressed data is returned as is. The decompressed output is limited to `limit` bytes,
/// larger outputs are rejected with [`io::ErrorKind::InvalidData`].
pub fn decompress(data: &[u8], limit: u64) -> io::Result<Cow<'_, [u8]>> {
    // For a comprehensive list also refer to
    // https://en.wikipedia.org/wiki/List_of_file_signatures
    match data {
        // Magic bytes for zstd
        // https://tools.ietf.org/id/draft-kucherawy-dispatch-zstd-00.html#rfc.section.2.1.1
        [0x28, 0xb5, 0x2f, 0xfd, ..] => {
            metric!(counter("compression") += 1, "type" => "zstd");
            read_limited(zstd::stream::read::Decoder::new(data)?, limit).map(Cow::Owned)
        }
        // Magic bytes for gzip
        // https://tools.ietf.org/html/rfc1952#section-2.3.1
        [0x1f, 0x8b, ..] => {
            metric!(counter("compression") += 1, "type" => "gz");
            read_limited(MultiGzDecoder::new(data), limit).map(Cow::Owned)
        }
        // Magic bytes for zlib
        [0x78, 0x01, ..] | [0x78, 0x9c, ..] | [0x78, 0xda, ..] => {
            metric!(counter("compression") += 1, "type" => "zlib");
            read_limited(ZlibDecoder::new(data), limit).map(Cow::Owned)
        }
        // Probably not compressed
        _ => Ok(Cow::Borrowed(data)),
    }
}

fn read_limited(reader: impl Read, limit: u64) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut buf)?;
    if buf.len() as u64 > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed data exceeds {limit} bytes"),
        ));
    }
    Ok(buf)
}
