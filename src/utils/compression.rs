//! # Compression
//!
//! The [`Compressor`] collaborator used by the envelope codec, with LZ4 and
//! Zstd implementations. Decompression is capped at [`MAX_DECOMPRESSED_SIZE`]
//! so a tiny frame cannot expand into an unbounded allocation.
//!
//! Outbound frames are compressed adaptively: payloads below the configured
//! threshold, or whose sampled entropy says they will not shrink, go out
//! uncompressed and the frame flag records which path was taken.

use std::io::Read;

use crate::config::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, Result};

/// Upper bound on any decompressed body.
pub const MAX_DECOMPRESSED_SIZE: usize = MAX_FRAME_SIZE;

/// Sampled entropy (bits per byte) above which compression is skipped.
const MAX_COMPRESSIBLE_ENTROPY: f64 = 4.0;

const ENTROPY_SAMPLE: usize = 512;

/// Byte-level compressor used on frame bodies.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Compress when it pays off. Returns the bytes and whether they are compressed.
    fn compress_adaptive(&self, data: &[u8], threshold_bytes: usize) -> Result<(Vec<u8>, bool)> {
        if !worth_compressing(data, threshold_bytes) {
            return Ok((data.to_vec(), false));
        }
        let compressed = self.compress(data)?;
        if compressed.len() < data.len() {
            Ok((compressed, true))
        } else {
            Ok((data.to_vec(), false))
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionKind {
    Lz4,
    Zstd,
}

impl CompressionKind {
    /// Parse a configured name. `"none"` yields `None`.
    pub fn from_name(name: &str) -> Result<Option<Self>> {
        match name.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(None),
            "lz4" => Ok(Some(CompressionKind::Lz4)),
            "zstd" => Ok(Some(CompressionKind::Zstd)),
            other => Err(ProtocolError::ConfigError(format!(
                "unknown compression '{other}'"
            ))),
        }
    }
}

impl Compressor for CompressionKind {
    fn name(&self) -> &'static str {
        match self {
            CompressionKind::Lz4 => "lz4",
            CompressionKind::Zstd => "zstd",
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        compress(data, self)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        decompress(data, self)
    }
}

/// Shannon entropy in bits per byte (0.0 uniform, 8.0 random).
fn entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    freq.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = f64::from(count) / len;
            -p * p.log2()
        })
        .sum()
}

fn worth_compressing(data: &[u8], threshold_bytes: usize) -> bool {
    if data.len() < threshold_bytes {
        return false;
    }
    if data.len() < 1024 {
        return true;
    }
    entropy(&data[..ENTROPY_SAMPLE]) < MAX_COMPRESSIBLE_ENTROPY
}

/// Compress `data` with `kind`.
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if the encoder fails.
pub fn compress(data: &[u8], kind: &CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, 1)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompress `data` that was produced by [`compress`] with the same kind.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` on malformed input or when
/// the output would exceed [`MAX_DECOMPRESSED_SIZE`].
pub fn decompress(data: &[u8], kind: &CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => {
            if data.len() < 4 {
                return Err(ProtocolError::DecompressionFailure);
            }
            // lz4_flex prepends the output size as u32 little-endian.
            let claimed = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed > MAX_DECOMPRESSED_SIZE {
                return Err(ProtocolError::DecompressionFailure);
            }
            lz4_flex::decompress_size_prepended(data)
                .map_err(|_| ProtocolError::DecompressionFailure)
        }
        CompressionKind::Zstd => {
            let decoder = zstd::stream::Decoder::new(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;
            let mut out = Vec::new();
            // Read one byte past the cap so overflow is detectable.
            decoder
                .take(MAX_DECOMPRESSED_SIZE as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|_| ProtocolError::DecompressionFailure)?;
            if out.len() > MAX_DECOMPRESSED_SIZE {
                return Err(ProtocolError::DecompressionFailure);
            }
            Ok(out)
        }
    }
}
