//! On-disk framing for stored values.
//!
//! Every file written by the file substrate is one frame:
//!
//! ```text
//! [magic: 4 bytes "DSSR"][version: 1 byte][length: 4 bytes LE][data: N bytes][crc32: 4 bytes LE]
//! ```
//!
//! The checksum lets a reader tell a torn or bit-rotted file from a valid one
//! instead of handing garbage to the document parser.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult};

use crc32fast::Hasher;

/// Current frame version.
const FRAME_VERSION: u8 = 1;

/// Magic bytes that open every frame.
pub const MAGIC: [u8; 4] = *b"DSSR";

/// Bytes a frame adds around its payload.
pub const FRAME_OVERHEAD: u64 = 4 + 1 + 4 + 4;

/// Largest payload accepted on read (256 MiB).
const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Wraps `data` in a frame.
///
/// # Errors
/// Returns `InvalidInput` if `data` does not fit a 32-bit length.
pub fn encode_frame(data: &[u8]) -> IoResult<Vec<u8>> {
    let len = u32::try_from(data.len())
        .map_err(|_| IoError::new(ErrorKind::InvalidInput, format!("frame of {} bytes is too large", data.len())))?;

    let mut out = Vec::with_capacity(data.len() + FRAME_OVERHEAD as usize);
    out.extend_from_slice(&MAGIC);
    out.push(FRAME_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&checksum(data).to_le_bytes());
    Ok(out)
}

/// Reads one frame and returns its verified payload.
///
/// # Errors
/// - `InvalidData` for a bad magic, an unknown version, an oversized length or
///   a checksum mismatch
/// - `UnexpectedEof` for a truncated frame
pub fn decode_frame(reader: &mut impl Read) -> IoResult<Vec<u8>> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != FRAME_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported frame version: {} (expected {FRAME_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("frame size {len} exceeds maximum {MAX_FRAME_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(&data);
    if stored != computed {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored:08x}, computed={computed:08x} (data corrupted)"),
        ));
    }

    Ok(data)
}
