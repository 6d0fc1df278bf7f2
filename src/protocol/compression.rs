//! Compressed frame format.
//!
//! A compressed block body travels as one or more frames:
//!
//! ```text
//! [checksum: 16 bytes CityHash128 of everything after it]
//! [method: 1 byte]
//! [compressed size: u32 LE, includes the 9 header bytes]
//! [decompressed size: u32 LE]
//! [data]
//! ```
//!
//! Only the block body is framed. Packet kind and table name stay plain.

use bytes::{BufMut, BytesMut};
use serde::Deserialize;

use super::wire::{WireError, WireReader, WireResult};

pub const CHECKSUM_LEN: usize = 16;
/// Method byte + compressed size + decompressed size.
pub const HEADER_LEN: usize = 9;
/// Largest frame the server will accept.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Method bytes.
pub mod method {
    pub const NONE: u8 = 0x02;
    pub const LZ4: u8 = 0x82;
    pub const ZSTD: u8 = 0x90;
}

/// Negotiated compression for data blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    #[default]
    None,
    Lz4,
}

impl CompressionMethod {
    pub fn is_enabled(self) -> bool {
        self != CompressionMethod::None
    }

    /// Value of the `network_compression_method` setting.
    pub fn setting_name(self) -> Option<&'static str> {
        match self {
            CompressionMethod::None => None,
            CompressionMethod::Lz4 => Some("lz4"),
        }
    }
}

fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let hash = cityhash_rs::cityhash_102_128(data);
    // Stored as (low, high) 64-bit halves of the reference implementation.
    (hash << 64 | hash >> 64).to_le_bytes()
}

/// Append `body` to `out` as a single LZ4 frame.
pub fn compress_frame(body: &[u8], out: &mut BytesMut) {
    let compressed = lz4_flex::block::compress(body);
    let start = out.len();
    out.put_bytes(0, CHECKSUM_LEN);
    out.put_u8(method::LZ4);
    out.put_u32_le((HEADER_LEN + compressed.len()) as u32);
    out.put_u32_le(body.len() as u32);
    out.extend_from_slice(&compressed);
    let sum = checksum(&out[start + CHECKSUM_LEN..]);
    out[start..start + CHECKSUM_LEN].copy_from_slice(&sum);
}

/// Decode the frame at the start of `r` and append its data to `out`.
pub fn decompress_frame(r: &mut WireReader<'_>, out: &mut Vec<u8>) -> WireResult<()> {
    let expected = r.bytes(CHECKSUM_LEN)?;
    let header = r.rest();
    if header.len() < HEADER_LEN {
        return Err(WireError::Incomplete);
    }
    let method_byte = header[0];
    let compressed_len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let decompressed_len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if compressed_len < HEADER_LEN || compressed_len > MAX_FRAME_LEN || decompressed_len > MAX_FRAME_LEN {
        return Err(WireError::Malformed(format!(
            "compressed frame sizes out of range ({} / {})",
            compressed_len, decompressed_len
        )));
    }
    let frame = r.bytes(compressed_len)?;
    if checksum(frame) != expected {
        return Err(WireError::Malformed("compressed frame checksum mismatch".to_string()));
    }
    let data = &frame[HEADER_LEN..];
    match method_byte {
        method::LZ4 => {
            let plain = lz4_flex::block::decompress(data, decompressed_len)
                .map_err(|e| WireError::Malformed(format!("LZ4 decompression failed: {}", e)))?;
            out.extend_from_slice(&plain);
        }
        method::NONE => {
            if data.len() != decompressed_len {
                return Err(WireError::Malformed("uncompressed frame size mismatch".to_string()));
            }
            out.extend_from_slice(data);
        }
        method::ZSTD => {
            return Err(WireError::Malformed("ZSTD frames are not supported".to_string()));
        }
        other => {
            return Err(WireError::Malformed(format!("unknown compression method 0x{:02x}", other)));
        }
    }
    Ok(())
}

/// Whether `buf` starts with a well-formed compressed frame header whose
/// checksum verifies. Used to reject compressed payloads on a connection
/// that negotiated no compression.
pub fn looks_compressed(buf: &[u8]) -> bool {
    if buf.len() < CHECKSUM_LEN + HEADER_LEN {
        return false;
    }
    let header = &buf[CHECKSUM_LEN..];
    if !matches!(header[0], method::NONE | method::LZ4 | method::ZSTD) {
        return false;
    }
    let compressed_len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if compressed_len < HEADER_LEN || header.len() < compressed_len {
        return false;
    }
    checksum(&header[..compressed_len]) == buf[..CHECKSUM_LEN]
}
