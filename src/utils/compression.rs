//! # Bundle Compression
//!
//! Compression filters applied to every bundle payload before framing.
//!
//! Decompression enforces the 64 MiB bundle cap *before* allocating: LZ4's
//! prepended size claim is checked up front, and Zstd output is read in
//! chunks against the limit. An inbound bundle that would inflate past the
//! cap is a fatal transport error.

use crate::config::MAX_BUNDLE_SIZE;
use crate::error::{ProtocolError, Result};

/// Maximum output size for decompression (aligned with the bundle cap).
const MAX_DECOMPRESSION_SIZE: usize = MAX_BUNDLE_SIZE;

/// Compression algorithm used by a channel's bundle filters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompressionKind {
    Lz4,
    Zstd,
}

impl CompressionKind {
    /// Resolve an algorithm from its configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lz4" => Some(CompressionKind::Lz4),
            "zstd" => Some(CompressionKind::Zstd),
            _ => None,
        }
    }
}

/// Compresses one bundle payload.
///
/// `level` applies to Zstd only; LZ4 has a single mode.
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if compression fails.
pub fn compress(data: &[u8], kind: CompressionKind, level: i32) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, level)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompresses one bundle payload, bounded by the 64 MiB bundle cap.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if:
/// - Decompression fails
/// - Output size exceeds the bundle cap
pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => {
            // Validate the claimed size before lz4_flex attempts allocation.
            // lz4_flex prepends the uncompressed size as 4 little-endian bytes.
            if data.len() < 4 {
                return Err(ProtocolError::DecompressionFailure);
            }

            let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed_size > MAX_DECOMPRESSION_SIZE {
                return Err(ProtocolError::DecompressionFailure);
            }

            let decompressed = lz4_flex::decompress_size_prepended(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;

            if decompressed.len() > MAX_DECOMPRESSION_SIZE {
                return Err(ProtocolError::DecompressionFailure);
            }
            Ok(decompressed)
        }
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            let mut reader = zstd::stream::Decoder::new(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;

            // Read in chunks to enforce the size limit as output grows.
            use std::io::Read;
            let mut buffer = [0u8; 8192];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        out.extend_from_slice(&buffer[..n]);
                        if out.len() > MAX_DECOMPRESSION_SIZE {
                            return Err(ProtocolError::DecompressionFailure);
                        }
                    }
                    Err(_) => return Err(ProtocolError::DecompressionFailure),
                }
            }
            Ok(out)
        }
    }
}
